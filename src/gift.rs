//! The gift easter egg
//!
//! Each guest draws one gift from a fixed catalogue. The drawn index is
//! remembered on the device so the guest keeps the same gift until it is
//! cleared.

use std::sync::Arc;

use rand::Rng;
use tracing::info;

use crate::error::Result;
use crate::state::local::KeyValueStore;

/// Key holding the index of the drawn gift
pub const GIFT_KEY: &str = "gift_drawn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gift {
    pub emoji: &'static str,
    pub title: &'static str,
    pub description: &'static str,
}

pub const GIFTS: [Gift; 15] = [
    Gift {
        emoji: "📸",
        title: "An exclusive photo of the couple",
        description: "Ask the couple for a photo striking the pose of your choice!",
    },
    Gift {
        emoji: "🎤",
        title: "A public compliment",
        description: "The couple will praise you on the microphone in front of everyone!",
    },
    Gift {
        emoji: "💃",
        title: "An exclusive dance",
        description: "The couple will dance to the song you pick... no rehearsal!",
    },
    Gift {
        emoji: "🎵",
        title: "Pick the next song",
        description: "You run the playlist! Choose the next song of the party.",
    },
    Gift {
        emoji: "🤳",
        title: "A selfie with the couple",
        description: "Official selfie with the couple from the best angle you want!",
    },
    Gift {
        emoji: "🥂",
        title: "A personalised toast",
        description: "The couple will raise a special toast in your honour!",
    },
    Gift {
        emoji: "👑",
        title: "Ruler of the dance floor for one song",
        description: "The floor is all yours for a whole song. Shine!",
    },
    Gift {
        emoji: "🫂",
        title: "A 10-second hug",
        description: "A group hug from the couple for ten long seconds!",
    },
    Gift {
        emoji: "🍷",
        title: "The couple's special drink",
        description: "The couple will make (or order) an exclusive drink for you!",
    },
    Gift {
        emoji: "📝",
        title: "A secret message",
        description: "The couple will tell you a secret nobody else knows!",
    },
    Gift {
        emoji: "🧁",
        title: "A sweet of your choice",
        description: "Pick any sweet from the table before everyone else!",
    },
    Gift {
        emoji: "🎬",
        title: "A movie scene with the couple",
        description: "Recreate an iconic movie scene with the couple. You choose which!",
    },
    Gift {
        emoji: "🌹",
        title: "A flower from the bouquet",
        description: "You get a flower straight from the couple's arrangement!",
    },
    Gift {
        emoji: "🎶",
        title: "Karaoke with the couple",
        description: "Sing a song with the couple, karaoke style!",
    },
    Gift {
        emoji: "✨",
        title: "A wish granted",
        description: "Make a reasonable request and the couple will make it happen at the party!",
    },
];

#[derive(Clone)]
pub struct GiftBox {
    kv: Arc<dyn KeyValueStore>,
}

impl GiftBox {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// The gift already drawn on this device, if the stored index is valid
    pub fn saved(&self) -> Result<Option<Gift>> {
        let index = self.kv.get(GIFT_KEY)?;
        Ok(index
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .and_then(|i| GIFTS.get(i).copied()))
    }

    /// The saved gift, or a fresh uniform draw that is then remembered
    pub fn get_or_draw(&self) -> Result<Gift> {
        if let Some(gift) = self.saved()? {
            return Ok(gift);
        }
        let index = rand::thread_rng().gen_range(0..GIFTS.len());
        self.kv.set(GIFT_KEY, &index.to_string())?;
        info!(index, title = GIFTS[index].title, "gift drawn");
        Ok(GIFTS[index])
    }

    pub fn clear(&self) -> Result<()> {
        self.kv.remove(GIFT_KEY)
    }
}

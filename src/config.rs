//! Application configuration
//!
//! Everything lives under one data directory:
//! - `config.json`: this struct
//! - `timeline.db`: image records
//! - `objects/`: uploaded photos
//! - `local.json`: guest-local state (name, gift, session)
//!
//! The data directory defaults to the user's data directory:
//! - Linux: ~/.local/share/wedding-timeline
//! - macOS: ~/Library/Application Support/wedding-timeline
//! - Windows: %APPDATA%\wedding-timeline

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::state::library::INSERT_POLL_INTERVAL;
use crate::store::SIGNED_URL_TTL;
use crate::timeline::PAGE_SIZE;

const APP_DIR: &str = "wedding-timeline";
const CONFIG_FILE: &str = "config.json";

/// Largest page the timeline will ask for
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Records per timeline page
    pub page_size: usize,
    /// Lifetime of signed URLs, in seconds
    pub url_ttl_secs: u64,
    /// How often a live timeline checks for photos shared from elsewhere
    pub poll_interval_ms: u64,
    /// Secret mixed into URL signatures
    pub signing_key: String,
    /// Hex SHA-256 of the invitation token; sign-in is impossible without it
    pub token_digest: Option<String>,
    #[serde(skip)]
    data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            url_ttl_secs: SIGNED_URL_TTL.as_secs(),
            poll_interval_ms: INSERT_POLL_INTERVAL.as_millis() as u64,
            signing_key: String::new(),
            token_digest: None,
            data_dir: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load `config.json` from `data_dir` (or the default directory).
    ///
    /// On first run the file is created with a random signing key.
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };
        let path = data_dir.join(CONFIG_FILE);

        let mut config: Config = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        config.data_dir = data_dir;

        if config.signing_key.is_empty() {
            config.signing_key = random_key();
            config.save()?;
            info!(path = %path.display(), "configuration initialized");
        }
        if !(1..=MAX_PAGE_SIZE).contains(&config.page_size) {
            return Err(Error::Validation(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if config.poll_interval_ms == 0 {
            return Err(Error::Validation("poll_interval_ms must be at least 1".to_string()));
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::write(
            self.data_dir.join(CONFIG_FILE),
            serde_json::to_vec_pretty(self)?,
        )?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("timeline.db")
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    pub fn local_state_path(&self) -> PathBuf {
        self.data_dir.join("local.json")
    }

    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| Error::Validation("could not determine user data directory".to_string()))?;
    path.push(APP_DIR);
    Ok(path)
}

fn random_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

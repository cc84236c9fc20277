use std::sync::Arc;

use tracing::info;

use super::data::validate_author;
use super::local::KeyValueStore;
use crate::error::Result;

/// Key holding the guest's confirmed display name
pub const GUEST_NAME_KEY: &str = "guest_name";

/// The display name a guest registered on this device
#[derive(Clone)]
pub struct GuestIdentity {
    kv: Arc<dyn KeyValueStore>,
}

impl GuestIdentity {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn name(&self) -> Result<Option<String>> {
        self.kv.get(GUEST_NAME_KEY)
    }

    /// Validate and remember `name`, returning the stored (trimmed) form
    pub fn set_name(&self, name: &str) -> Result<String> {
        let name = validate_author(name)?;
        self.kv.set(GUEST_NAME_KEY, &name)?;
        info!(guest = %name, "guest name registered");
        Ok(name)
    }

    pub fn clear(&self) -> Result<()> {
        self.kv.remove(GUEST_NAME_KEY)
    }
}

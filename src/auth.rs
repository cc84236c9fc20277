//! Guest session from the shared invitation link
//!
//! The link carries a token; it is accepted when its SHA-256 digest matches
//! the configured one. A successful sign-in is remembered on the device.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::state::local::KeyValueStore;

/// Key holding the persisted session flag
pub const SESSION_KEY: &str = "session_authenticated";

/// Hex SHA-256 digest of a token, the form stored in configuration
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}

#[derive(Clone)]
pub struct GuestSession {
    kv: Arc<dyn KeyValueStore>,
    token_digest: Option<String>,
}

impl GuestSession {
    /// `token_digest` is `None` when no invitation token is configured;
    /// every sign-in is then refused.
    pub fn new(kv: Arc<dyn KeyValueStore>, token_digest: Option<String>) -> Self {
        Self {
            kv,
            token_digest: token_digest.map(|d| d.trim().to_ascii_lowercase()),
        }
    }

    pub fn is_authenticated(&self) -> Result<bool> {
        Ok(self.kv.get(SESSION_KEY)?.as_deref() == Some("1"))
    }

    pub fn sign_in(&self, token: &str) -> Result<()> {
        let Some(expected) = self.token_digest.as_deref() else {
            return Err(Error::Auth("no invitation token configured".to_string()));
        };
        if token.trim().is_empty() || token_digest(token) != expected {
            warn!("sign-in rejected");
            return Err(Error::Auth("invalid invitation token".to_string()));
        }

        self.kv.set(SESSION_KEY, "1")?;
        info!("guest signed in");
        Ok(())
    }

    pub fn sign_out(&self) -> Result<()> {
        self.kv.remove(SESSION_KEY)
    }

    /// Fail unless a session exists
    pub fn require(&self) -> Result<()> {
        if self.is_authenticated()? {
            Ok(())
        } else {
            Err(Error::Auth("sign in with your invitation link first".to_string()))
        }
    }
}

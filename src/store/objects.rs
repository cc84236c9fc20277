//! Filesystem object storage with signed URLs
//!
//! Objects are written under a root directory, keyed by their storage path.
//! Content metadata lives next to them in `.meta/<path>.json`.
//! Signed URLs carry an expiry and an HMAC-SHA256 of `path \n expiry`
//! keyed with the signing key, checked by `verify_signature`.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use super::ObjectStore;
use crate::error::{Error, Result};

const META_DIR: &str = ".meta";

type HmacSha256 = Hmac<Sha256>;

/// Sidecar metadata for a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub content_type: String,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    signing_key: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, signing_key: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            signing_key: signing_key.into(),
        }
    }

    /// Resolve a storage path under the root, rejecting anything that escapes it
    fn object_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let clean = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && !path.starts_with(META_DIR);
        if !clean {
            return Err(Error::Validation(format!("invalid storage path: {:?}", path)));
        }
        Ok(self.root.join(relative))
    }

    fn meta_path(&self, path: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{}.json", path))
    }

    /// Metadata recorded when the object was stored
    pub async fn object_meta(&self, path: &str) -> Result<ObjectMeta> {
        self.object_path(path)?;
        match tokio::fs::read(self.meta_path(path)).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ObjectNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mac(&self, path: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.signing_key.as_bytes())
            .map_err(|e| Error::Validation(format!("unusable signing key: {}", e)))?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    fn signature(&self, path: &str, expires: i64) -> Result<String> {
        Ok(hex::encode(self.mac(path, expires)?.finalize().into_bytes()))
    }

    /// Check a signature previously issued for `path`, valid until `expires`
    pub fn verify_signature(&self, path: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        if now.timestamp() >= expires {
            return false;
        }
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        // verify_slice compares in constant time
        self.mac(path, expires)
            .map(|mac| mac.verify_slice(&expected).is_ok())
            .unwrap_or(false)
    }

    async fn ensure_exists(&self, path: &str) -> Result<PathBuf> {
        let full = self.object_path(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(m) if m.is_file() => Ok(full),
            Ok(_) => Err(Error::ObjectNotFound(path.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ObjectNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn signed_url(&self, full: &Path, path: &str, expires: i64) -> Result<String> {
        Ok(format!(
            "file://{}?expires={}&signature={}",
            full.display(),
            expires,
            self.signature(path, expires)?
        ))
    }
}

fn expiry(ttl: Duration) -> i64 {
    Utc::now().timestamp() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let full = self.object_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
            stored_at: Utc::now(),
        };
        tokio::fs::write(&full, bytes).await?;

        let meta_path = self.meta_path(path);
        if let Some(parent) = meta_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&meta_path, serde_json::to_vec(&meta)?).await?;

        debug!(path, content_type, size = meta.size, "stored object");
        Ok(())
    }

    async fn sign_url(&self, path: &str, ttl: Duration) -> Result<String> {
        let full = self.ensure_exists(path).await?;
        self.signed_url(&full, path, expiry(ttl))
    }

    async fn sign_urls(&self, paths: &[String], ttl: Duration) -> Result<Vec<String>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let expires = expiry(ttl);
        let mut urls = Vec::with_capacity(paths.len());
        for path in paths {
            let full = self.ensure_exists(path).await?;
            urls.push(self.signed_url(&full, path, expires)?);
        }
        debug!(count = urls.len(), "signed URL batch");
        Ok(urls)
    }
}

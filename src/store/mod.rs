//! Storage boundary
//!
//! The timeline and the upload pipeline only talk to storage through the
//! traits in this module:
//! - `RecordStore`: image metadata rows, cursor queries and insert notifications
//! - `ObjectStore`: binary objects and signed URL issuance
//!
//! `state::library::Library` implements `RecordStore` on SQLite and
//! `objects::LocalObjectStore` implements `ObjectStore` on the filesystem.

pub mod objects;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::Result;
use crate::state::data::{Cursor, ImageRecord, NewImageRecord};

/// Lifetime of every signed URL handed to the timeline
pub const SIGNED_URL_TTL: Duration = Duration::from_secs(3600);

/// Row storage for image metadata
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Up to `limit` records ordered by `created_at` descending.
    /// With `before`, only records strictly older than it are returned.
    async fn query_page(&self, before: Option<Cursor>, limit: usize) -> Result<Vec<ImageRecord>>;

    /// Persist a record; the store assigns `id` and `created_at`
    async fn insert_record(&self, record: NewImageRecord) -> Result<ImageRecord>;

    /// Start receiving every record inserted from now on
    fn subscribe_inserts(&self) -> InsertSubscription;
}

/// Binary object storage keyed by path
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    async fn sign_url(&self, path: &str, ttl: Duration) -> Result<String>;

    /// Batched form of `sign_url`: one call, output in input order.
    /// An empty input must return an empty output without touching storage.
    async fn sign_urls(&self, paths: &[String], ttl: Duration) -> Result<Vec<String>>;
}

/// A live feed of inserted records.
///
/// Dropping the subscription or calling `unsubscribe` stops delivery.
#[derive(Debug)]
pub struct InsertSubscription {
    rx: Option<broadcast::Receiver<ImageRecord>>,
}

impl InsertSubscription {
    pub fn new(rx: broadcast::Receiver<ImageRecord>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Next inserted record, or `None` once unsubscribed or the store is gone
    pub async fn recv(&mut self) -> Option<ImageRecord> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(record) => return Some(record),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "insert subscription lagged, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.rx = None;
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}

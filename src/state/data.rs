//! Shared data structures for the application state
//!
//! These structs represent the data model that flows between
//! the record store, the timeline and the upload pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Longest display name a guest may register
pub const MAX_AUTHOR_LEN: usize = 64;

/// Pagination cursor: the `created_at` of the last item of the previous page
pub type Cursor = DateTime<Utc>;

/// One row of image metadata referencing a stored object by path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    /// Unique id assigned by the store
    pub id: Uuid,
    /// Key into object storage
    pub storage_path: String,
    /// Guest display name
    pub author: String,
    /// When the photo was shared by the guest
    pub moment: DateTime<Utc>,
    /// When the row was persisted; the sort and pagination key
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the client when inserting a record.
/// `id` and `created_at` are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImageRecord {
    pub storage_path: String,
    pub author: String,
    pub moment: DateTime<Utc>,
}

/// A record plus its resolved, time-limited URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineItem {
    #[serde(flatten)]
    pub record: ImageRecord,
    pub url: String,
}

impl TimelineItem {
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }
}

/// Trim and check a display name.
///
/// Names must be 1 to 64 characters after trimming surrounding whitespace.
pub fn validate_author(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("author name is empty".to_string()));
    }
    let len = trimmed.chars().count();
    if len > MAX_AUTHOR_LEN {
        return Err(Error::Validation(format!(
            "author name has {} characters, at most {} allowed",
            len, MAX_AUTHOR_LEN
        )));
    }
    Ok(trimmed.to_string())
}

//! Error types shared by the stores, the timeline and the upload pipeline

use thiserror::Error;

/// All errors produced by the library side of the application
#[derive(Debug, Error)]
pub enum Error {
    /// The record database failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Reading or writing a local file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Local state or object metadata could not be (de)serialized
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// No object is stored under the requested path
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// A store answered in a shape its contract rules out
    #[error("storage contract violated: {0}")]
    Contract(String),

    /// Input rejected before reaching a store
    #[error("invalid input: {0}")]
    Validation(String),

    /// The guest session is missing or the token was rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A background task panicked or was cancelled
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

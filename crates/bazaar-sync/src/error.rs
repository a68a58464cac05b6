//! Error taxonomy for the sync core.
//!
//! Every variant carries owned strings so a single failure can be handed to
//! every caller joined on a coalesced operation and kept on a `CachedView`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Fetch of {collection} for {owner} failed: {reason}")]
    Fetch {
        collection: String,
        owner: String,
        reason: String,
    },

    #[error("Change feed for {table} disconnected: {reason}")]
    ChannelDisconnect { table: String, reason: String },

    #[error("Thumbnail generation for {source_locator} failed: {reason}")]
    Generation {
        source_locator: String,
        reason: String,
    },

    #[error("Deleting {table}/{id} failed: {reason}")]
    Deletion {
        table: String,
        id: String,
        reason: String,
    },

    #[error("Persisting acknowledgement for {id} failed: {reason}")]
    PersistMarker { id: String, reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task error: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

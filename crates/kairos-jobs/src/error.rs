//! Error types for the job scheduler.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::netstring::FramingError;
use crate::store::StoreError;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum JobsError {
    /// A shard log could not be framed or unframed.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backing object store failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// A job was scheduled outside the shard's `[min, max)` window.
    #[error("due time {due_time} is outside shard window [{min}, {max})")]
    OutsideWindow {
        due_time: DateTime<Utc>,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    },

    /// The local silo does not own the shard it tried to mutate.
    #[error("shard {shard_id} is not owned by this silo")]
    NotOwner { shard_id: String },

    /// The shard's recorded owner differs from the caller.
    #[error(
        "shard {shard_id} is owned by {}, not {expected}",
        actual.as_deref().unwrap_or("nobody")
    )]
    OwnershipViolation {
        shard_id: String,
        expected: String,
        actual: Option<String>,
    },

    /// Shard not found in the backing store.
    #[error("shard not found: {0}")]
    ShardNotFound(String),

    /// A flush failed; the in-memory state can no longer be trusted.
    #[error("shard {shard_id} is faulted: {reason}")]
    ShardFaulted { shard_id: String, reason: String },

    /// The shard was marked complete and accepts no new jobs.
    #[error("shard {0} is complete")]
    ShardCompleted(String),

    /// The shard's writer has been stopped.
    #[error("shard {0} is closed")]
    ShardClosed(String),

    /// Shard creation kept failing.
    #[error("failed to create shard after {attempts} attempts: {source}")]
    ShardCreation {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// Stored shard metadata could not be interpreted.
    #[error("invalid shard metadata: {0}")]
    InvalidMetadata(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl JobsError {
    /// Whether this error means another silo now owns the shard.
    pub fn is_ownership_error(&self) -> bool {
        matches!(
            self,
            JobsError::NotOwner { .. }
                | JobsError::OwnershipViolation { .. }
                | JobsError::Store(StoreError::PreconditionFailed { .. })
        )
    }
}

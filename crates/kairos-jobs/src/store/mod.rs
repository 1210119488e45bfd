//! Durable object storage consumed by shards and the shard manager.
//!
//! Objects are append-only logs with a small metadata map. Every write is
//! conditioned on the object's current [`ETag`], which is the only
//! synchronization primitive shared between silos.

mod local;
mod memory;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Metadata;

pub use local::LocalObjectStore;
pub use memory::InMemoryObjectStore;

/// Version tag of an object; changes on every successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ETag(pub u64);

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Errors returned by an [`ObjectStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Conditional write lost a race.
    #[error("precondition failed for {name}: expected etag {expected}, found {actual}")]
    PreconditionFailed {
        name: String,
        expected: ETag,
        actual: ETag,
    },

    /// Object name cannot be stored.
    #[error("invalid object name: {0}")]
    InvalidName(String),

    /// Stored object is unreadable.
    #[error("corrupt object {name}: {reason}")]
    Corrupt { name: String, reason: String },

    /// Backend temporarily unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Properties of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectProperties {
    pub name: String,
    pub metadata: Metadata,
    pub etag: ETag,
}

/// Append-capable object store with conditional writes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create an empty object. Returns `None` if the name is already taken.
    async fn create_if_not_exists(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> Result<Option<ETag>, StoreError>;

    /// List objects whose name starts with `prefix`, in name order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectProperties>, StoreError>;

    /// Fetch current metadata and etag.
    async fn properties(&self, name: &str) -> Result<ObjectProperties, StoreError>;

    /// Read the whole log from the beginning.
    async fn read(&self, name: &str) -> Result<(Vec<u8>, ETag), StoreError>;

    /// Append a block if the object is still at `if_match`.
    async fn append(&self, name: &str, block: &[u8], if_match: ETag) -> Result<ETag, StoreError>;

    /// Replace metadata if the object is still at `if_match`.
    async fn set_metadata(
        &self,
        name: &str,
        metadata: &Metadata,
        if_match: ETag,
    ) -> Result<ETag, StoreError>;

    /// Delete the object if it is still at `if_match`.
    async fn delete(&self, name: &str, if_match: ETag) -> Result<(), StoreError>;
}

pub(crate) fn check_etag(name: &str, expected: ETag, actual: ETag) -> Result<(), StoreError> {
    if expected == actual {
        Ok(())
    } else {
        Err(StoreError::PreconditionFailed {
            name: name.to_string(),
            expected,
            actual,
        })
    }
}

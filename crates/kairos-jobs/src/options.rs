//! Tunables for shards and the shard manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::JobsError;
use crate::netstring::DEFAULT_MAX_FRAME_LEN;

/// Options shared by a manager and the shards it opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardOptions {
    /// Prefix of every shard object name.
    pub shard_prefix: String,
    /// Batches smaller than this wait for the flush interval before committing.
    pub min_batch_size: usize,
    /// Hard cap on operations per committed segment.
    pub max_batch_size: usize,
    /// How long an undersized batch may wait for more operations.
    pub batch_flush_interval_ms: u64,
    /// Storage failures tolerated while creating a shard object.
    pub max_shard_creation_retries: u32,
    /// Largest accepted log record.
    pub max_frame_len: usize,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            shard_prefix: "jobs".to_string(),
            min_batch_size: 1,
            max_batch_size: 128,
            batch_flush_interval_ms: 50,
            max_shard_creation_retries: 5,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ShardOptions {
    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<(), JobsError> {
        if self.min_batch_size == 0 {
            return Err(JobsError::InvalidConfig(
                "min_batch_size must be at least 1".to_string(),
            ));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(JobsError::InvalidConfig(format!(
                "min_batch_size ({}) exceeds max_batch_size ({})",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.shard_prefix.is_empty() {
            return Err(JobsError::InvalidConfig(
                "shard_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

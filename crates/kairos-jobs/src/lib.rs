//! Durable sharded job scheduler for Kairos.
//!
//! This crate provides a time-partitioned scheduler that:
//! - Stores jobs in append-only shard logs of netstring-framed JSON operations
//! - Rebuilds each shard's due-time index by replaying its log
//! - Batches writes and commits them with conditional appends
//! - Hands shards of dead silos to live ones through compare-and-swap claims
//! - Runs due jobs with bounded concurrency and exponential retry

mod error;
mod executor;
mod manager;
pub mod membership;
pub mod netstring;
pub mod operation;
mod options;
mod shard;
pub mod store;
mod types;

pub use error::JobsError;
pub use executor::{
    ExecutorOptions, JobHandler, JobRunResult, RetryPolicy, RunSummary, ShardExecutor,
};
pub use manager::JobShardManager;
pub use membership::{
    InMemoryMembership, MembershipService, MembershipSnapshot, SiloStatus, SingleNodeMembership,
};
pub use netstring::FramingError;
pub use operation::JobOperation;
pub use options::ShardOptions;
pub use shard::{JobIndex, JobShard, WriterStats};
pub use store::{ETag, InMemoryObjectStore, LocalObjectStore, ObjectStore, StoreError};
pub use types::{
    COMPLETED_KEY, Job, JobContext, MAX_DUE_TIME_KEY, MEMBERSHIP_VERSION_KEY, MIN_DUE_TIME_KEY,
    Metadata, OWNER_KEY, ShardInfo, SiloAddress, TargetRef, is_reserved_key,
};

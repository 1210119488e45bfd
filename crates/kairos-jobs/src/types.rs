//! Scheduler types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobsError;

/// String-to-string metadata attached to shards and jobs.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key holding the current owner of a shard.
pub const OWNER_KEY: &str = "Owner";
/// Metadata key holding the membership version observed by the last owner change.
pub const MEMBERSHIP_VERSION_KEY: &str = "MembershipVersion";
/// Metadata key holding the start of a shard's window.
pub const MIN_DUE_TIME_KEY: &str = "MinDueTime";
/// Metadata key holding the end of a shard's window.
pub const MAX_DUE_TIME_KEY: &str = "MaxDueTime";
/// Metadata key set once a shard accepts no further jobs.
pub const COMPLETED_KEY: &str = "Completed";

const RESERVED_KEYS: [&str; 5] = [
    OWNER_KEY,
    MEMBERSHIP_VERSION_KEY,
    MIN_DUE_TIME_KEY,
    MAX_DUE_TIME_KEY,
    COMPLETED_KEY,
];

/// Whether a metadata key is managed by the scheduler itself.
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Address of one silo incarnation.
///
/// The same endpoint restarted is a different silo: ownership recorded by a
/// previous incarnation is treated as orphaned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiloAddress {
    pub endpoint: String,
    pub incarnation: u64,
}

impl SiloAddress {
    pub fn new(endpoint: impl Into<String>, incarnation: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            incarnation,
        }
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.incarnation)
    }
}

impl FromStr for SiloAddress {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (endpoint, incarnation) = s
            .rsplit_once('@')
            .ok_or_else(|| JobsError::InvalidMetadata(format!("invalid silo address: {}", s)))?;
        if endpoint.is_empty() {
            return Err(JobsError::InvalidMetadata(format!(
                "invalid silo address: {}",
                s
            )));
        }
        let incarnation = incarnation.parse().map_err(|_| {
            JobsError::InvalidMetadata(format!("invalid silo incarnation: {}", s))
        })?;
        Ok(Self::new(endpoint, incarnation))
    }
}

/// Opaque reference to whatever a job invokes when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetRef(pub String);

impl TargetRef {
    pub fn new(target: impl Into<String>) -> Self {
        Self(target.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique within its shard.
    pub id: String,
    /// Human-readable name for the job.
    pub name: String,
    /// What the job invokes.
    pub target: TargetRef,
    /// When the job becomes eligible for delivery.
    pub due_time: DateTime<Utc>,
    /// Shard holding the job.
    pub shard_id: String,
    /// Optional caller metadata, immutable once set.
    pub metadata: Option<Metadata>,
}

/// One delivery of a job to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job: Job,
    /// Fresh for every delivery.
    pub run_id: String,
    /// Number of times this shard instance has delivered the job.
    pub dequeue_count: u32,
}

/// Durable description of a shard, as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub id: String,
    pub min_time: DateTime<Utc>,
    pub max_time: DateTime<Utc>,
    pub owner: Option<SiloAddress>,
    pub membership_version: u64,
    pub completed: bool,
    /// User metadata (reserved keys stripped).
    pub metadata: Metadata,
}

impl ShardInfo {
    /// Build the stored metadata map for this shard.
    pub fn to_metadata(&self) -> Metadata {
        let mut map = self.metadata.clone();
        map.insert(MIN_DUE_TIME_KEY.to_string(), self.min_time.to_rfc3339());
        map.insert(MAX_DUE_TIME_KEY.to_string(), self.max_time.to_rfc3339());
        map.insert(
            MEMBERSHIP_VERSION_KEY.to_string(),
            self.membership_version.to_string(),
        );
        if let Some(owner) = &self.owner {
            map.insert(OWNER_KEY.to_string(), owner.to_string());
        }
        if self.completed {
            map.insert(COMPLETED_KEY.to_string(), "true".to_string());
        }
        map
    }

    /// Parse stored metadata back into shard info.
    ///
    /// Missing window bounds default to an unbounded window and a missing or
    /// unparsable membership version defaults to 0.
    pub fn from_metadata(id: impl Into<String>, stored: &Metadata) -> Result<Self, JobsError> {
        let id = id.into();
        let owner = stored
            .get(OWNER_KEY)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<SiloAddress>())
            .transpose()?;
        let membership_version = stored
            .get(MEMBERSHIP_VERSION_KEY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let min_time =
            parse_time(stored.get(MIN_DUE_TIME_KEY))?.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let max_time =
            parse_time(stored.get(MAX_DUE_TIME_KEY))?.unwrap_or(DateTime::<Utc>::MAX_UTC);
        let completed = stored.get(COMPLETED_KEY).is_some_and(|v| v == "true");
        let metadata = stored
            .iter()
            .filter(|(k, _)| !is_reserved_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            id,
            min_time,
            max_time,
            owner,
            membership_version,
            completed,
            metadata,
        })
    }
}

fn parse_time(value: Option<&String>) -> Result<Option<DateTime<Utc>>, JobsError> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| JobsError::InvalidMetadata(format!("invalid time '{}': {}", s, e)))
        })
        .transpose()
}

//! Cluster membership consumed by the shard manager.
//!
//! The manager never detects silo failure itself: it reads a versioned
//! snapshot of silo statuses and treats any silo not reported alive as a
//! valid takeover target.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::types::SiloAddress;

/// Lifecycle status of a silo as reported by membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiloStatus {
    Joining,
    Active,
    ShuttingDown,
    Stopping,
    Dead,
}

impl SiloStatus {
    /// Whether a silo in this status may still be holding shards.
    pub fn is_alive(self) -> bool {
        !matches!(self, SiloStatus::Dead)
    }
}

/// Point-in-time view of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub members: HashMap<SiloAddress, SiloStatus>,
    /// Monotonic; bumps on every membership change.
    pub version: u64,
}

impl MembershipSnapshot {
    /// Status of a silo, or `None` if membership has never heard of it.
    pub fn status(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.members.get(silo).copied()
    }

    /// Alive silos only. Unknown silos are not alive.
    pub fn is_alive(&self, silo: &SiloAddress) -> bool {
        self.status(silo).is_some_and(SiloStatus::is_alive)
    }
}

/// Source of membership snapshots.
#[async_trait]
pub trait MembershipService: Send + Sync {
    /// The latest snapshot known locally.
    fn snapshot(&self) -> MembershipSnapshot;

    /// Bring the local view up to at least `min_version`.
    async fn refresh(&self, min_version: u64);
}

/// Membership table held in memory and driven by the caller.
#[derive(Debug, Default)]
pub struct InMemoryMembership {
    state: RwLock<MembershipSnapshot>,
}

impl InMemoryMembership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a status change and bump the version.
    pub fn set_status(&self, silo: SiloAddress, status: SiloStatus) {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.members.insert(silo, status);
        state.version += 1;
    }
}

#[async_trait]
impl MembershipService for InMemoryMembership {
    fn snapshot(&self) -> MembershipSnapshot {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn refresh(&self, _min_version: u64) {}
}

/// Membership for a single node: only the local silo is alive.
///
/// Every shard owned by any other silo, including earlier incarnations of
/// this one, is considered orphaned.
#[derive(Debug, Clone)]
pub struct SingleNodeMembership {
    local: SiloAddress,
}

impl SingleNodeMembership {
    pub fn new(local: SiloAddress) -> Arc<Self> {
        Arc::new(Self { local })
    }
}

#[async_trait]
impl MembershipService for SingleNodeMembership {
    fn snapshot(&self) -> MembershipSnapshot {
        let mut members = HashMap::new();
        members.insert(self.local.clone(), SiloStatus::Active);
        MembershipSnapshot {
            members,
            version: 1,
        }
    }

    async fn refresh(&self, _min_version: u64) {}
}

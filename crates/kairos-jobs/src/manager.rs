//! Shard registration, assignment and release.
//!
//! Managers on different silos share one object store and never talk to
//! each other. Ownership of a shard is the `Owner` entry in its metadata,
//! and every change to it is a conditional write against the etag the
//! manager observed, so concurrent claimants cannot both win.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::JobsError;
use crate::membership::MembershipService;
use crate::operation;
use crate::options::ShardOptions;
use crate::shard::{JobIndex, JobShard};
use crate::store::{ObjectProperties, ObjectStore, StoreError};
use crate::types::{Job, Metadata, ShardInfo, SiloAddress};

/// Manages the shards of one silo.
pub struct JobShardManager {
    silo: SiloAddress,
    store: Arc<dyn ObjectStore>,
    membership: Arc<dyn MembershipService>,
    options: ShardOptions,
    /// Shards this silo holds open.
    shards: DashMap<String, JobShard>,
    next_counter: AtomicU64,
}

impl JobShardManager {
    pub fn new(
        silo: SiloAddress,
        store: Arc<dyn ObjectStore>,
        membership: Arc<dyn MembershipService>,
        options: ShardOptions,
    ) -> Result<Self, JobsError> {
        options.validate()?;
        Ok(Self {
            silo,
            store,
            membership,
            options,
            shards: DashMap::new(),
            next_counter: AtomicU64::new(0),
        })
    }

    /// The silo this manager acts for.
    pub fn silo(&self) -> &SiloAddress {
        &self.silo
    }

    pub fn options(&self) -> &ShardOptions {
        &self.options
    }

    /// Shards currently held open by this silo.
    pub fn owned_shards(&self) -> Vec<JobShard> {
        self.shards.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Create a new shard covering `[min_time, max_time)`.
    ///
    /// With `assign_to_creator` the shard is created already owned by this
    /// silo. Otherwise it starts unowned, the returned handle rejects
    /// mutations, and any silo may claim it through
    /// [`assign_job_shards`](Self::assign_job_shards).
    #[tracing::instrument(skip(self, metadata), fields(silo = %self.silo))]
    pub async fn register_shard(
        &self,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
        metadata: Metadata,
        assign_to_creator: bool,
    ) -> Result<JobShard, JobsError> {
        if min_time >= max_time {
            return Err(JobsError::InvalidConfig(format!(
                "shard window [{}, {}) is empty",
                min_time, max_time
            )));
        }

        let mut info = ShardInfo {
            id: String::new(),
            min_time,
            max_time,
            owner: assign_to_creator.then(|| self.silo.clone()),
            membership_version: self.membership.snapshot().version,
            completed: false,
            metadata: metadata
                .into_iter()
                .filter(|(key, _)| !crate::types::is_reserved_key(key))
                .collect(),
        };

        let mut failures = 0u32;
        loop {
            info.id = self.next_shard_id(min_time);
            match self
                .store
                .create_if_not_exists(&info.id, &info.to_metadata())
                .await
            {
                Ok(Some(_)) => break,
                Ok(None) => {
                    debug!(shard_id = %info.id, "shard id collision, retrying");
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.options.max_shard_creation_retries {
                        return Err(JobsError::ShardCreation {
                            attempts: failures,
                            source: e,
                        });
                    }
                    warn!(
                        shard_id = %info.id,
                        attempt = failures,
                        error = %e,
                        "failed to create shard"
                    );
                }
            }
        }

        let shard = JobShard::open(
            Arc::clone(&self.store),
            info.clone(),
            &self.options,
            assign_to_creator,
        )
        .await?;
        if assign_to_creator {
            self.shards.insert(info.id.clone(), shard.clone());
        }

        info!(
            shard_id = %info.id,
            min_time = %min_time,
            max_time = %max_time,
            assigned = assign_to_creator,
            "registered shard"
        );
        Ok(shard)
    }

    /// Claim shards that start by `horizon` and have no live owner.
    ///
    /// Returns every shard this silo already holds plus at most
    /// `max_new_claims` newly claimed ones. Losing a claim race to another
    /// silo is not an error; that shard is just left out.
    #[tracing::instrument(skip(self), fields(silo = %self.silo))]
    pub async fn assign_job_shards(
        &self,
        horizon: DateTime<Utc>,
        max_new_claims: usize,
    ) -> Result<Vec<JobShard>, JobsError> {
        let mut snapshot = self.membership.snapshot();
        let candidates = self.store.list(&self.shard_prefix()).await?;

        let mut assigned = Vec::new();
        let mut claimed = 0usize;

        for props in candidates {
            let info = match ShardInfo::from_metadata(&props.name, &props.metadata) {
                Ok(info) => info,
                Err(e) => {
                    warn!(
                        shard_id = %props.name,
                        error = %e,
                        "skipping shard with unreadable metadata"
                    );
                    continue;
                }
            };
            if info.min_time > horizon {
                continue;
            }

            if info.membership_version > snapshot.version {
                self.membership.refresh(info.membership_version).await;
                snapshot = self.membership.snapshot();
            }

            match &info.owner {
                Some(owner) if *owner == self.silo => {
                    let cached = self.shards.get(&props.name).map(|s| s.value().clone());
                    if let Some(shard) = cached {
                        assigned.push(shard);
                    } else {
                        warn!(
                            shard_id = %props.name,
                            "shard owned by this silo is not open, releasing"
                        );
                        self.release_ownership(&props, info.clone()).await;
                    }
                    continue;
                }
                Some(owner) if snapshot.is_alive(owner) => continue,
                _ => {}
            }

            if claimed >= max_new_claims {
                debug!(shard_id = %props.name, "claim budget exhausted");
                continue;
            }

            let previous_owner = info.owner.clone();
            let mut claim = info;
            claim.owner = Some(self.silo.clone());
            claim.membership_version = snapshot.version;

            match self
                .store
                .set_metadata(&props.name, &claim.to_metadata(), props.etag)
                .await
            {
                Ok(_) => {}
                Err(StoreError::PreconditionFailed { .. } | StoreError::NotFound(_)) => {
                    debug!(shard_id = %props.name, "lost shard claim race");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let shard =
                JobShard::open(Arc::clone(&self.store), claim, &self.options, true).await?;
            if let Some(previous) = previous_owner {
                // The dead owner may have been scheduling into this shard.
                shard.mark_as_complete().await?;
                info!(
                    shard_id = %props.name,
                    previous_owner = %previous,
                    jobs = shard.job_count().await,
                    "took over orphaned shard"
                );
            } else {
                info!(
                    shard_id = %props.name,
                    jobs = shard.job_count().await,
                    completed = shard.is_completed(),
                    "claimed unowned shard"
                );
            }

            self.shards.insert(props.name.clone(), shard.clone());
            claimed += 1;
            assigned.push(shard);
        }

        Ok(assigned)
    }

    /// Give up a shard owned by this silo.
    ///
    /// The shard's writer is stopped first. A shard with no jobs left is
    /// deleted. Otherwise its owner is cleared and it is marked complete, so
    /// another silo can claim it and drain the remaining jobs.
    #[tracing::instrument(skip(self, shard), fields(silo = %self.silo, shard_id = %shard.id()))]
    pub async fn unregister_shard(&self, shard: &JobShard) -> Result<(), JobsError> {
        let shard_id = shard.id().to_string();
        if let Err(e) = shard.stop().await {
            warn!(error = %e, "shard did not stop cleanly");
        }
        self.shards.remove(&shard_id);

        let props = match self.store.properties(&shard_id).await {
            Ok(props) => props,
            Err(StoreError::NotFound(_)) => return Err(JobsError::ShardNotFound(shard_id)),
            Err(e) => return Err(e.into()),
        };
        let info = ShardInfo::from_metadata(&shard_id, &props.metadata)?;
        if info.owner.as_ref() != Some(&self.silo) {
            return Err(JobsError::OwnershipViolation {
                shard_id,
                expected: self.silo.to_string(),
                actual: info.owner.map(|owner| owner.to_string()),
            });
        }

        let remaining = shard.job_count().await;
        if remaining == 0 {
            self.store.delete(&shard_id, props.etag).await?;
            info!("deleted drained shard");
        } else {
            // Whoever claims it next only drains what is left.
            let mut released = info;
            released.owner = None;
            released.completed = true;
            self.store
                .set_metadata(&shard_id, &released.to_metadata(), props.etag)
                .await?;
            info!(jobs = remaining, "released shard with remaining jobs");
        }
        Ok(())
    }

    /// Stop every open shard without releasing ownership.
    ///
    /// Pending operations are committed. Another silo can take the shards
    /// over once membership reports this silo dead.
    pub async fn shutdown(&self) {
        let shards = self.owned_shards();
        self.shards.clear();
        for shard in shards {
            if let Err(e) = shard.stop().await {
                warn!(shard_id = %shard.id(), error = %e, "error stopping shard");
            }
        }
        info!(silo = %self.silo, "shard manager shut down");
    }

    /// Describe every shard in the store.
    pub async fn list_shards(&self) -> Result<Vec<ShardInfo>, JobsError> {
        self.store
            .list(&self.shard_prefix())
            .await?
            .into_iter()
            .map(|props| ShardInfo::from_metadata(&props.name, &props.metadata))
            .collect()
    }

    /// Replay a shard's log without opening it, for inspection.
    pub async fn read_shard(&self, shard_id: &str) -> Result<(ShardInfo, Vec<Job>), JobsError> {
        let props = match self.store.properties(shard_id).await {
            Ok(props) => props,
            Err(StoreError::NotFound(_)) => {
                return Err(JobsError::ShardNotFound(shard_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let info = ShardInfo::from_metadata(shard_id, &props.metadata)?;

        let (data, _) = self.store.read(shard_id).await?;
        let mut index = JobIndex::new();
        let mut ops = pin!(operation::decode(&data[..], self.options.max_frame_len));
        while let Some(op) = ops.next().await {
            index.apply(&op?, shard_id);
        }
        Ok((info, index.jobs()))
    }

    /// Clear this silo's ownership of a shard it does not hold open.
    async fn release_ownership(&self, props: &ObjectProperties, mut info: ShardInfo) {
        info.owner = None;
        info.completed = true;
        if let Err(e) = self
            .store
            .set_metadata(&props.name, &info.to_metadata(), props.etag)
            .await
        {
            warn!(shard_id = %props.name, error = %e, "failed to release shard ownership");
        }
    }

    fn shard_prefix(&self) -> String {
        format!("{}-", self.options.shard_prefix)
    }

    fn next_shard_id(&self, min_time: DateTime<Utc>) -> String {
        let counter = self.next_counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{}-{}",
            self.options.shard_prefix,
            min_time.format("%Y%m%d%H%M"),
            self.silo,
            counter
        )
    }
}

//! Multi-silo scenarios for shard registration, takeover and release.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::future::join_all;
use pretty_assertions::assert_eq;

use kairos_jobs::{
    InMemoryMembership, InMemoryObjectStore, JobShard, JobShardManager, JobsError, Metadata,
    ObjectStore, OWNER_KEY, ShardOptions, SiloAddress, SiloStatus, TargetRef,
};

struct Cluster {
    store: Arc<InMemoryObjectStore>,
    membership: Arc<InMemoryMembership>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            store: Arc::new(InMemoryObjectStore::new()),
            membership: InMemoryMembership::new(),
        }
    }

    fn silo(&self, n: u64) -> JobShardManager {
        let silo = SiloAddress::new(format!("10.0.0.{}:11111", n), 1);
        self.membership.set_status(silo.clone(), SiloStatus::Active);
        JobShardManager::new(
            silo,
            self.store.clone(),
            self.membership.clone(),
            ShardOptions::default(),
        )
        .unwrap()
    }

    fn kill(&self, manager: &JobShardManager) {
        self.membership
            .set_status(manager.silo().clone(), SiloStatus::Dead);
    }
}

fn ms(n: i64) -> chrono::Duration {
    chrono::Duration::milliseconds(n)
}

async fn register(manager: &JobShardManager, start: DateTime<Utc>) -> JobShard {
    manager
        .register_shard(start, start + chrono::Duration::hours(1), Metadata::new(), true)
        .await
        .unwrap()
}

/// Consume until the stream ends, acknowledging every job.
async fn drain(shard: &JobShard) -> Vec<String> {
    let mut names = Vec::new();
    let mut jobs = shard.consume_durable_jobs();
    while let Some(ctx) = tokio::time::timeout(Duration::from_secs(5), jobs.next())
        .await
        .unwrap()
    {
        names.push(ctx.job.name.clone());
        shard.remove_job(&ctx.job.id).await.unwrap();
    }
    names
}

#[tokio::test]
async fn test_jobs_delivered_in_due_order_and_never_early() {
    let cluster = Cluster::new();
    let manager = cluster.silo(1);
    let now = Utc::now();
    let shard = register(&manager, now).await;

    let mut scheduled = Vec::new();
    for (name, offset) in [("+50", 50), ("+100", 100), ("+60", 60), ("+150", 150)] {
        let job = shard
            .try_schedule_job(TargetRef::new("grain/1"), name, now + ms(offset), None)
            .await
            .unwrap();
        scheduled.push(job);
    }
    assert_eq!(shard.job_count().await, 4);

    // Cancel the last one before it is due.
    shard.remove_job(&scheduled[3].id).await.unwrap();

    let mut jobs = shard.consume_durable_jobs();
    let mut order = Vec::new();
    for _ in 0..3 {
        let ctx = tokio::time::timeout(Duration::from_secs(5), jobs.next())
            .await
            .unwrap()
            .unwrap();
        assert!(Utc::now() >= ctx.job.due_time, "delivered before due time");
        assert_eq!(ctx.dequeue_count, 1);
        order.push(ctx.job.name.clone());
    }
    assert_eq!(order, vec!["+50", "+60", "+100"]);

    let cancelled = tokio::time::timeout(Duration::from_millis(300), jobs.next()).await;
    assert!(cancelled.is_err(), "cancelled job was delivered");
}

#[tokio::test]
async fn test_cancellation_survives_takeover() {
    let cluster = Cluster::new();
    let first = cluster.silo(1);
    let second = cluster.silo(2);
    let now = Utc::now();

    let shard = register(&first, now).await;
    let a = shard
        .try_schedule_job(TargetRef::new("t"), "A", now + ms(20), None)
        .await
        .unwrap();
    shard
        .try_schedule_job(TargetRef::new("t"), "B", now + ms(40), None)
        .await
        .unwrap();
    shard.remove_job(&a.id).await.unwrap();

    // Nothing to take while the first silo is alive.
    assert!(second.assign_job_shards(now, usize::MAX).await.unwrap().is_empty());

    cluster.kill(&first);
    let taken = second.assign_job_shards(now, usize::MAX).await.unwrap();
    assert_eq!(taken.len(), 1);
    let taken = &taken[0];
    assert_eq!(taken.id(), shard.id());
    assert_eq!(taken.job_count().await, 1);
    assert!(taken.is_completed());

    assert_eq!(drain(taken).await, vec!["B"]);
}

#[tokio::test]
async fn test_old_owner_is_fenced_after_takeover() {
    let cluster = Cluster::new();
    let first = cluster.silo(1);
    let second = cluster.silo(2);
    let now = Utc::now();

    let shard = register(&first, now).await;
    cluster.kill(&first);
    assert_eq!(second.assign_job_shards(now, usize::MAX).await.unwrap().len(), 1);

    let err = shard
        .try_schedule_job(TargetRef::new("t"), "zombie", now + ms(10), None)
        .await
        .unwrap_err();
    assert!(matches!(err, JobsError::ShardFaulted { .. }));
    assert!(shard.is_faulted());
    assert!(!shard.is_owned());

    // The write never reached the log, and the old owner does not deliver it.
    let (_, jobs) = second.read_shard(shard.id()).await.unwrap();
    assert!(jobs.is_empty());
    assert_eq!(shard.job_count().await, 0);
    let next = tokio::time::timeout(Duration::from_secs(1), shard.consume_durable_jobs().next())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_waiting_consumer_stops_when_owner_is_fenced() {
    let cluster = Cluster::new();
    let first = cluster.silo(1);
    let second = cluster.silo(2);
    let now = Utc::now();

    let shard = register(&first, now).await;
    shard
        .try_schedule_job(TargetRef::new("t"), "later", now + chrono::Duration::minutes(30), None)
        .await
        .unwrap();

    let consuming = shard.clone();
    let consumer = tokio::spawn(async move {
        let mut jobs = consuming.consume_durable_jobs();
        let mut names = Vec::new();
        while let Some(ctx) = jobs.next().await {
            names.push(ctx.job.name);
        }
        names
    });

    cluster.kill(&first);
    assert_eq!(second.assign_job_shards(now, usize::MAX).await.unwrap().len(), 1);
    assert!(
        shard
            .try_schedule_job(TargetRef::new("t"), "zombie", now, None)
            .await
            .is_err()
    );

    let delivered = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .unwrap()
        .unwrap();
    assert!(delivered.is_empty());
}

#[tokio::test]
async fn test_exactly_one_concurrent_claimant_wins() {
    let cluster = Cluster::new();
    let owner = cluster.silo(1);
    let now = Utc::now();
    let shard = register(&owner, now).await;
    cluster.kill(&owner);

    let contenders: Vec<JobShardManager> = (2..10).map(|n| cluster.silo(n)).collect();
    let results = join_all(
        contenders
            .iter()
            .map(|manager| manager.assign_job_shards(now, usize::MAX)),
    )
    .await;

    let winners = results
        .into_iter()
        .map(|result| result.unwrap())
        .filter(|assigned| assigned.iter().any(|s| s.id() == shard.id()))
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_slow_start_limits_new_claims() {
    let cluster = Cluster::new();
    let owner = cluster.silo(1);
    let now = Utc::now();
    for _ in 0..5 {
        register(&owner, now).await;
    }
    cluster.kill(&owner);

    let claimer = cluster.silo(2);
    assert_eq!(claimer.assign_job_shards(now, 2).await.unwrap().len(), 2);
    // Shards already held are returned without using the budget.
    assert_eq!(claimer.assign_job_shards(now, 2).await.unwrap().len(), 4);
    assert_eq!(claimer.assign_job_shards(now, 2).await.unwrap().len(), 5);
    assert_eq!(claimer.owned_shards().len(), 5);
}

#[tokio::test]
async fn test_live_owner_keeps_its_shards() {
    let cluster = Cluster::new();
    let owner = cluster.silo(1);
    let other = cluster.silo(2);
    let now = Utc::now();
    let shard = register(&owner, now).await;

    let mine = owner.assign_job_shards(now, usize::MAX).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id(), shard.id());
    assert!(other.assign_job_shards(now, usize::MAX).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unregister_with_jobs_makes_shard_assignable() {
    let cluster = Cluster::new();
    let first = cluster.silo(1);
    let second = cluster.silo(2);
    let now = Utc::now();

    let shard = register(&first, now).await;
    shard
        .try_schedule_job(TargetRef::new("t"), "left", now + ms(10), None)
        .await
        .unwrap();
    first.unregister_shard(&shard).await.unwrap();

    let props = cluster.store.properties(shard.id()).await.unwrap();
    assert!(!props.metadata.contains_key(OWNER_KEY));
    assert!(first.owned_shards().is_empty());

    let taken = second.assign_job_shards(now, usize::MAX).await.unwrap();
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].job_count().await, 1);
    assert!(taken[0].is_completed());
    assert_eq!(drain(&taken[0]).await, vec!["left"]);
}

#[tokio::test]
async fn test_unregister_drained_shard_deletes_it() {
    let cluster = Cluster::new();
    let manager = cluster.silo(1);
    let now = Utc::now();

    let shard = register(&manager, now).await;
    shard
        .try_schedule_job(TargetRef::new("t"), "only", now, None)
        .await
        .unwrap();
    shard.mark_as_complete().await.unwrap();
    assert_eq!(drain(&shard).await, vec!["only"]);

    manager.unregister_shard(&shard).await.unwrap();
    assert!(cluster.store.is_empty().await);
}

#[tokio::test]
async fn test_unregister_by_former_owner_is_rejected() {
    let cluster = Cluster::new();
    let first = cluster.silo(1);
    let second = cluster.silo(2);
    let now = Utc::now();

    let shard = register(&first, now).await;
    cluster.kill(&first);
    second.assign_job_shards(now, usize::MAX).await.unwrap();

    let err = first.unregister_shard(&shard).await.unwrap_err();
    match err {
        JobsError::OwnershipViolation {
            expected, actual, ..
        } => {
            assert_eq!(expected, first.silo().to_string());
            assert_eq!(actual, Some(second.silo().to_string()));
        }
        other => panic!("expected ownership violation, got {other:?}"),
    }
    // The shard itself is untouched.
    assert!(cluster.store.properties(shard.id()).await.is_ok());
}

#[tokio::test]
async fn test_unregister_missing_shard_is_not_found() {
    let cluster = Cluster::new();
    let manager = cluster.silo(1);
    let now = Utc::now();
    let shard = register(&manager, now).await;
    manager.unregister_shard(&shard).await.unwrap();

    assert!(matches!(
        manager.unregister_shard(&shard).await,
        Err(JobsError::ShardNotFound(_))
    ));
}

#[tokio::test]
async fn test_restart_releases_stale_self_ownership() {
    let cluster = Cluster::new();
    let silo = SiloAddress::new("10.0.0.1:11111", 1);
    cluster.membership.set_status(silo.clone(), SiloStatus::Active);
    let now = Utc::now();

    let before = JobShardManager::new(
        silo.clone(),
        cluster.store.clone(),
        cluster.membership.clone(),
        ShardOptions::default(),
    )
    .unwrap();
    let shard = register(&before, now).await;
    before.shutdown().await;

    // Same address, fresh process: the shard is recorded as ours but not open.
    let after = JobShardManager::new(
        silo,
        cluster.store.clone(),
        cluster.membership.clone(),
        ShardOptions::default(),
    )
    .unwrap();
    assert!(after.assign_job_shards(now, usize::MAX).await.unwrap().is_empty());
    let props = cluster.store.properties(shard.id()).await.unwrap();
    assert!(!props.metadata.contains_key(OWNER_KEY));

    let reclaimed = after.assign_job_shards(now, usize::MAX).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert!(reclaimed[0].is_completed());
}

#[tokio::test]
async fn test_metadata_update_is_persisted() {
    let cluster = Cluster::new();
    let manager = cluster.silo(1);
    let now = Utc::now();
    let mut metadata = Metadata::new();
    metadata.insert("TenantId".to_string(), "tenant-1".to_string());
    let shard = manager
        .register_shard(now, now + chrono::Duration::hours(1), metadata, true)
        .await
        .unwrap();

    let mut update = Metadata::new();
    update.insert("Region".to_string(), "eu".to_string());
    shard.update_metadata(update).await.unwrap();

    let shards = manager.list_shards().await.unwrap();
    assert_eq!(shards.len(), 1);
    assert_eq!(shards[0].metadata.get("TenantId").map(String::as_str), Some("tenant-1"));
    assert_eq!(shards[0].metadata.get("Region").map(String::as_str), Some("eu"));
    assert_eq!(shards[0].owner.as_ref(), Some(manager.silo()));

    // Still writable afterwards: the metadata write advanced the etag.
    shard
        .try_schedule_job(TargetRef::new("t"), "after", now, None)
        .await
        .unwrap();
}

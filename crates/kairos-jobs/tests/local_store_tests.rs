//! Restart scenarios against the local-directory store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use kairos_jobs::{
    JobShardManager, LocalObjectStore, Metadata, ShardOptions, SiloAddress, SingleNodeMembership,
    TargetRef,
};

async fn single_node(dir: &TempDir, incarnation: u64) -> JobShardManager {
    let silo = SiloAddress::new("127.0.0.1:7000", incarnation);
    let store = LocalObjectStore::open(dir.path()).await.unwrap();
    JobShardManager::new(
        silo.clone(),
        Arc::new(store),
        SingleNodeMembership::new(silo),
        ShardOptions::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_restarted_node_recovers_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();

    let shard_id = {
        let manager = single_node(&dir, 1).await;
        let shard = manager
            .register_shard(now, now + Duration::hours(1), Metadata::new(), true)
            .await
            .unwrap();
        let keep = shard
            .try_schedule_job(TargetRef::new("t"), "keep", now + Duration::minutes(5), None)
            .await
            .unwrap();
        let cancel = shard
            .try_schedule_job(TargetRef::new("t"), "cancel", now + Duration::minutes(1), None)
            .await
            .unwrap();
        shard.remove_job(&cancel.id).await.unwrap();
        assert_eq!(keep.shard_id, shard.id());
        manager.shutdown().await;
        shard.id().to_string()
    };

    // New incarnation: the previous one is no longer a live member.
    let manager = single_node(&dir, 2).await;
    let assigned = manager.assign_job_shards(now, usize::MAX).await.unwrap();
    assert_eq!(assigned.len(), 1);
    let shard = &assigned[0];
    assert_eq!(shard.id(), shard_id);
    assert!(shard.is_completed());

    let names: Vec<String> = shard.jobs().await.into_iter().map(|job| job.name).collect();
    assert_eq!(names, vec!["keep"]);
}

#[tokio::test]
async fn test_inspection_reads_log_without_claiming() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();

    let manager = single_node(&dir, 1).await;
    let shard = manager
        .register_shard(now, now + Duration::hours(1), Metadata::new(), true)
        .await
        .unwrap();
    for minutes in [3, 1, 2] {
        shard
            .try_schedule_job(
                TargetRef::new("t"),
                &format!("m{}", minutes),
                now + Duration::minutes(minutes),
                None,
            )
            .await
            .unwrap();
    }

    let observer = single_node(&dir, 9).await;
    let shards = observer.list_shards().await.unwrap();
    assert_eq!(shards.len(), 1);
    assert_eq!(shards[0].owner.as_ref(), Some(manager.silo()));

    let (info, jobs) = observer.read_shard(shard.id()).await.unwrap();
    assert_eq!(info.id, shard.id());
    let names: Vec<String> = jobs.into_iter().map(|job| job.name).collect();
    assert_eq!(names, vec!["m1", "m2", "m3"]);
    assert!(observer.owned_shards().is_empty());
}

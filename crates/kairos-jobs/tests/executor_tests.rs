//! Tests for running shards through the executor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use tokio::sync::watch;

use kairos_jobs::{
    ExecutorOptions, InMemoryMembership, InMemoryObjectStore, JobContext, JobHandler,
    JobRunResult, JobShard, JobShardManager, Metadata, RetryPolicy, RunSummary, ShardExecutor,
    ShardOptions, SiloAddress, SiloStatus, TargetRef,
};

fn manager() -> JobShardManager {
    let silo = SiloAddress::new("10.0.0.1:11111", 1);
    let membership = InMemoryMembership::new();
    membership.set_status(silo.clone(), SiloStatus::Active);
    JobShardManager::new(
        silo,
        Arc::new(InMemoryObjectStore::new()),
        membership,
        ShardOptions::default(),
    )
    .unwrap()
}

async fn shard_with_jobs(manager: &JobShardManager, names: &[&str]) -> JobShard {
    let now = Utc::now();
    let shard = manager
        .register_shard(now, now + chrono::Duration::hours(1), Metadata::new(), true)
        .await
        .unwrap();
    for (i, name) in names.iter().enumerate() {
        shard
            .try_schedule_job(
                TargetRef::new("t"),
                name,
                now + chrono::Duration::milliseconds(10 * i as i64),
                None,
            )
            .await
            .unwrap();
    }
    shard.mark_as_complete().await.unwrap();
    shard
}

fn fast_retry() -> ExecutorOptions {
    ExecutorOptions {
        max_concurrent_jobs: 4,
        retry: RetryPolicy {
            base_delay_ms: 10,
            max_delay_ms: 50,
            max_attempts: 3,
        },
    }
}

async fn run(executor: &ShardExecutor, shard: JobShard) -> RunSummary {
    let (_tx, rx) = watch::channel(false);
    tokio::time::timeout(Duration::from_secs(10), executor.run_shard(shard, rx))
        .await
        .unwrap()
}

/// Records every job it sees and completes it.
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, ctx: &JobContext) -> JobRunResult {
        self.seen.lock().unwrap().push(ctx.job.name.clone());
        JobRunResult::Completed
    }
}

#[tokio::test]
async fn test_completed_jobs_are_removed() {
    let manager = manager();
    let shard = shard_with_jobs(&manager, &["a", "b", "c"]).await;
    let handler = Arc::new(RecordingHandler::default());
    let executor = ShardExecutor::new(handler.clone(), fast_retry());

    let summary = run(&executor, shard.clone()).await;

    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.completed, 3);
    assert_eq!(shard.job_count().await, 0);
    let mut seen = handler.seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c"]);
}

/// Fails each job until it has been delivered `succeed_on` times.
struct FlakyHandler {
    succeed_on: u32,
    attempts: Mutex<HashMap<String, Vec<u32>>>,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(&self, ctx: &JobContext) -> JobRunResult {
        self.attempts
            .lock()
            .unwrap()
            .entry(ctx.job.name.clone())
            .or_default()
            .push(ctx.dequeue_count);
        if ctx.dequeue_count >= self.succeed_on {
            JobRunResult::Completed
        } else {
            JobRunResult::Failed("not yet".to_string())
        }
    }
}

#[tokio::test]
async fn test_failed_job_is_retried_with_new_delivery() {
    let manager = manager();
    let shard = shard_with_jobs(&manager, &["flaky"]).await;
    let handler = Arc::new(FlakyHandler {
        succeed_on: 2,
        attempts: Mutex::new(HashMap::new()),
    });
    let executor = ShardExecutor::new(handler.clone(), fast_retry());

    let summary = run(&executor, shard.clone()).await;

    assert_eq!(summary.retried, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(handler.attempts.lock().unwrap()["flaky"], vec![1, 2]);
    assert_eq!(shard.job_count().await, 0);
}

#[tokio::test]
async fn test_job_abandoned_after_max_attempts() {
    let manager = manager();
    let shard = shard_with_jobs(&manager, &["doomed"]).await;
    let handler = Arc::new(FlakyHandler {
        succeed_on: u32::MAX,
        attempts: Mutex::new(HashMap::new()),
    });
    let executor = ShardExecutor::new(handler.clone(), fast_retry());

    let summary = run(&executor, shard.clone()).await;

    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.retried, 2);
    assert_eq!(handler.attempts.lock().unwrap()["doomed"], vec![1, 2, 3]);
    assert_eq!(shard.job_count().await, 0);
}

/// Reports the job as still running once before completing.
#[derive(Default)]
struct PollingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl JobHandler for PollingHandler {
    async fn handle(&self, _ctx: &JobContext) -> JobRunResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            JobRunResult::PollAfter(Duration::from_millis(10))
        } else {
            JobRunResult::Completed
        }
    }
}

#[tokio::test]
async fn test_poll_after_calls_handler_again() {
    let manager = manager();
    let shard = shard_with_jobs(&manager, &["slow"]).await;
    let handler = Arc::new(PollingHandler::default());
    let executor = ShardExecutor::new(handler.clone(), fast_retry());

    let summary = run(&executor, shard).await;

    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
}

/// Tracks how many invocations overlap.
#[derive(Default)]
struct ConcurrencyProbe {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl JobHandler for ConcurrencyProbe {
    async fn handle(&self, _ctx: &JobContext) -> JobRunResult {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        JobRunResult::Completed
    }
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let manager = manager();
    let now = Utc::now();
    let shard = manager
        .register_shard(now, now + chrono::Duration::hours(1), Metadata::new(), true)
        .await
        .unwrap();
    for i in 0..12 {
        shard
            .try_schedule_job(TargetRef::new("t"), &format!("j{}", i), now, None)
            .await
            .unwrap();
    }
    shard.mark_as_complete().await.unwrap();

    let probe = Arc::new(ConcurrencyProbe::default());
    let executor = ShardExecutor::new(
        probe.clone(),
        ExecutorOptions {
            max_concurrent_jobs: 3,
            ..fast_retry()
        },
    );
    let summary = run(&executor, shard).await;

    assert_eq!(summary.completed, 12);
    assert!(probe.peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_shutdown_stops_pulling_jobs() {
    let manager = manager();
    let now = Utc::now();
    let shard = manager
        .register_shard(now, now + chrono::Duration::hours(1), Metadata::new(), true)
        .await
        .unwrap();
    shard
        .try_schedule_job(
            TargetRef::new("t"),
            "later",
            now + chrono::Duration::minutes(30),
            None,
        )
        .await
        .unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let executor = ShardExecutor::new(handler.clone(), fast_retry());
    let (tx, rx) = watch::channel(false);

    let running = executor.run_shard(shard.clone(), rx);
    let stop = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
    };
    let (summary, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(running, stop)
    })
    .await
    .unwrap();

    assert_eq!(summary.delivered, 0);
    assert!(handler.seen.lock().unwrap().is_empty());
    // The job is still there for whoever runs the shard next.
    assert_eq!(shard.job_count().await, 1);
}

#[tokio::test]
async fn test_waits_for_shard_start() {
    let manager = manager();
    let start = Utc::now() + chrono::Duration::milliseconds(100);
    let shard = manager
        .register_shard(start, start + chrono::Duration::hours(1), Metadata::new(), true)
        .await
        .unwrap();
    shard
        .try_schedule_job(TargetRef::new("t"), "first", start, None)
        .await
        .unwrap();
    shard.mark_as_complete().await.unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let executor = ShardExecutor::new(handler.clone(), fast_retry());
    let summary = run(&executor, shard).await;

    assert!(Utc::now() >= start);
    assert_eq!(summary.completed, 1);
}

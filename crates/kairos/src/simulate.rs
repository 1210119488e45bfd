//! In-process takeover demo: two silos share one in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Result;
use tokio::sync::watch;
use tracing::info;

use kairos_jobs::{
    ExecutorOptions, InMemoryMembership, InMemoryObjectStore, JobContext, JobHandler,
    JobRunResult, JobShardManager, Metadata, ShardExecutor, ShardOptions, SiloAddress, SiloStatus,
    TargetRef,
};

/// Records when each job fired.
#[derive(Default)]
struct Recorder {
    fired: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
}

#[async_trait]
impl JobHandler for Recorder {
    async fn handle(&self, ctx: &JobContext) -> JobRunResult {
        if let Ok(mut fired) = self.fired.lock() {
            fired.push((ctx.job.name.clone(), ctx.job.due_time, Utc::now()));
        }
        JobRunResult::Completed
    }
}

/// What the simulation observed.
#[derive(Debug)]
pub struct Outcome {
    pub scheduled: Vec<String>,
    pub cancelled: Vec<String>,
    /// Job name, due time and fire time, in firing order.
    pub fired: Vec<(String, DateTime<Utc>, DateTime<Utc>)>,
}

/// Schedule jobs on silo A, kill it, and let silo B take over and run them.
pub async fn simulate(jobs: usize, spacing_ms: u64, cancel_every: usize) -> Result<Outcome> {
    let store = Arc::new(InMemoryObjectStore::new());
    let membership = InMemoryMembership::new();
    let silo_a = SiloAddress::new("10.0.0.1:11111", 1);
    let silo_b = SiloAddress::new("10.0.0.2:11111", 1);
    membership.set_status(silo_a.clone(), SiloStatus::Active);
    membership.set_status(silo_b.clone(), SiloStatus::Active);

    let manager_a = JobShardManager::new(
        silo_a.clone(),
        store.clone(),
        membership.clone(),
        ShardOptions::default(),
    )
    .map_err(|e| miette::miette!("{}", e))?;
    let manager_b = JobShardManager::new(
        silo_b.clone(),
        store.clone(),
        membership.clone(),
        ShardOptions::default(),
    )
    .map_err(|e| miette::miette!("{}", e))?;

    let now = Utc::now();
    let shard = manager_a
        .register_shard(now, now + chrono::Duration::hours(1), Metadata::new(), true)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let mut scheduled = Vec::with_capacity(jobs);
    let mut cancelled = Vec::new();
    for i in 0..jobs {
        let name = format!("job-{}", i + 1);
        let due_time = now + chrono::Duration::milliseconds(((i as u64 + 1) * spacing_ms) as i64);
        let job = shard
            .try_schedule_job(TargetRef::new("simulation"), &name, due_time, None)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        if cancel_every > 0 && (i + 1) % cancel_every == 0 {
            shard
                .remove_job(&job.id)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            cancelled.push(name);
        } else {
            scheduled.push(name);
        }
    }
    info!(
        shard_id = %shard.id(),
        scheduled = scheduled.len(),
        cancelled = cancelled.len(),
        "silo A scheduled jobs"
    );

    // Silo A dies without releasing anything.
    membership.set_status(silo_a.clone(), SiloStatus::Dead);
    drop(shard);
    drop(manager_a);
    info!(silo = %silo_a, "silo A declared dead");

    let assigned = manager_b
        .assign_job_shards(now + chrono::Duration::hours(1), usize::MAX)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let recorder = Arc::new(Recorder::default());
    let executor = ShardExecutor::new(recorder.clone(), ExecutorOptions::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    for shard in assigned {
        let summary = executor.run_shard(shard.clone(), shutdown_rx.clone()).await;
        info!(shard_id = %shard.id(), completed = summary.completed, "silo B drained shard");
        manager_b
            .unregister_shard(&shard)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
    }
    manager_b.shutdown().await;

    let fired = recorder
        .fired
        .lock()
        .map_err(|_| miette::miette!("recorder lock poisoned"))?
        .clone();
    Ok(Outcome {
        scheduled,
        cancelled,
        fired,
    })
}

/// Run the simulation and print what happened.
pub async fn run(jobs: usize, spacing_ms: u64, cancel_every: usize) -> Result<()> {
    let deadline = Duration::from_millis(spacing_ms.saturating_mul(jobs as u64 + 1) + 10_000);
    let outcome = tokio::time::timeout(deadline, simulate(jobs, spacing_ms, cancel_every))
        .await
        .map_err(|_| miette::miette!("simulation did not finish within {:?}", deadline))??;

    println!("cancelled before failover: {}", outcome.cancelled.join(", "));
    println!("fired after failover:");
    for (name, due, fired) in &outcome.fired {
        println!(
            "  {:<10} due {}  late {}ms",
            name,
            due.format("%H:%M:%S%.3f"),
            (*fired - *due).num_milliseconds()
        );
    }
    Ok(())
}

//! Single-node commands over a local store directory.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Result;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use kairos_jobs::{
    Job, JobContext, JobHandler, JobRunResult, JobShardManager, LocalObjectStore, Metadata,
    ShardExecutor, ShardInfo, SingleNodeMembership, TargetRef,
};

use crate::{JobSpec, NodeArgs};

/// Target recorded for jobs scheduled from the command line.
const CLI_TARGET: &str = "kairos-cli";

async fn open_manager(node: &NodeArgs) -> Result<JobShardManager> {
    let store = LocalObjectStore::open(&node.store_dir)
        .await
        .map_err(|e| miette::miette!("failed to open store {}: {}", node.store_dir.display(), e))?;
    let silo = node.silo_address();
    JobShardManager::new(
        silo.clone(),
        Arc::new(store),
        SingleNodeMembership::new(silo),
        node.shard_options(),
    )
    .map_err(|e| miette::miette!("{}", e))
}

/// Register a shard starting now and schedule `jobs` in it.
pub async fn schedule(node: &NodeArgs, window_minutes: i64, jobs: &[JobSpec]) -> Result<()> {
    let manager = open_manager(node).await?;
    let now = Utc::now();
    let shard = manager
        .register_shard(
            now,
            now + chrono::Duration::minutes(window_minutes),
            Metadata::new(),
            true,
        )
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let mut result = Ok(());
    for spec in jobs {
        let due_time = now + chrono::Duration::seconds(spec.delay_secs);
        match shard
            .try_schedule_job(TargetRef::new(CLI_TARGET), &spec.name, due_time, None)
            .await
        {
            Ok(job) => println!("{}  {}  {}", job.id, job.due_time.to_rfc3339(), job.name),
            Err(e) => {
                result = Err(miette::miette!("failed to schedule '{}': {}", spec.name, e));
                break;
            }
        }
    }

    // Leave the shard owned by this silo; a runner takes it over.
    manager.shutdown().await;
    println!("shard {}", shard.id());
    result
}

/// Completes every job after logging it.
struct LoggingHandler;

#[async_trait]
impl JobHandler for LoggingHandler {
    async fn handle(&self, ctx: &JobContext) -> JobRunResult {
        let late_ms = (Utc::now() - ctx.job.due_time).num_milliseconds();
        info!(
            job_id = %ctx.job.id,
            name = %ctx.job.name,
            target = %ctx.job.target,
            attempt = ctx.dequeue_count,
            late_ms,
            "job fired"
        );
        JobRunResult::Completed
    }
}

/// Claim shards and run their jobs until interrupted.
pub async fn run(
    node: &NodeArgs,
    horizon_minutes: i64,
    assign_interval_secs: u64,
    max_new_claims: usize,
    once: bool,
) -> Result<()> {
    let manager = Arc::new(open_manager(node).await?);
    let executor = Arc::new(ShardExecutor::new(
        Arc::new(LoggingHandler),
        node.executor_options(),
    ));
    info!(silo = %manager.silo(), store = %node.store_dir.display(), "runner starting");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let horizon = chrono::Duration::minutes(horizon_minutes);
    let interval = Duration::from_secs(assign_interval_secs.max(1));
    let mut running: HashSet<String> = HashSet::new();
    let mut tasks = JoinSet::new();

    loop {
        let now = Utc::now();
        match manager.assign_job_shards(now + horizon, max_new_claims).await {
            Ok(shards) => {
                for shard in shards {
                    if running.insert(shard.id().to_string()) {
                        let executor = Arc::clone(&executor);
                        let shutdown = shutdown_rx.clone();
                        tasks.spawn(async move {
                            let summary = executor.run_shard(shard.clone(), shutdown).await;
                            (shard, summary)
                        });
                    }
                }
            }
            Err(e) => warn!(error = %e, "shard assignment failed"),
        }

        // Nothing can be scheduled into a window that has passed.
        for shard in manager.owned_shards() {
            if shard.max_time() <= now && !shard.is_completed() {
                if let Err(e) = shard.mark_as_complete().await {
                    warn!(shard_id = %shard.id(), error = %e, "failed to complete shard");
                }
            }
        }

        if once && tasks.is_empty() {
            break;
        }

        tokio::select! {
            Some(joined) = tasks.join_next() => {
                match joined {
                    Ok((shard, summary)) => {
                        running.remove(shard.id());
                        info!(
                            shard_id = %shard.id(),
                            delivered = summary.delivered,
                            completed = summary.completed,
                            retried = summary.retried,
                            abandoned = summary.abandoned,
                            "shard run finished"
                        );
                        if shard.job_count().await == 0 {
                            if let Err(e) = manager.unregister_shard(&shard).await {
                                warn!(
                                    shard_id = %shard.id(),
                                    error = %e,
                                    "failed to unregister shard"
                                );
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "shard task panicked"),
                }
            }
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "shard task panicked");
        }
    }
    manager.shutdown().await;
    Ok(())
}

/// Shard description printed by `inspect`.
#[derive(Debug, Serialize)]
struct ShardReport {
    id: String,
    min_time: DateTime<Utc>,
    max_time: DateTime<Utc>,
    owner: Option<String>,
    membership_version: u64,
    completed: bool,
    metadata: Metadata,
    jobs: Vec<Job>,
}

impl ShardReport {
    fn new(info: ShardInfo, jobs: Vec<Job>) -> Self {
        Self {
            id: info.id,
            min_time: info.min_time,
            max_time: info.max_time,
            owner: info.owner.map(|owner| owner.to_string()),
            membership_version: info.membership_version,
            completed: info.completed,
            metadata: info.metadata,
            jobs,
        }
    }
}

/// Print every shard and its live jobs without claiming anything.
pub async fn inspect(node: &NodeArgs, json: bool) -> Result<()> {
    let manager = open_manager(node).await?;
    let shards = manager
        .list_shards()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let mut reports = Vec::with_capacity(shards.len());
    for info in shards {
        let (info, jobs) = manager
            .read_shard(&info.id)
            .await
            .map_err(|e| miette::miette!("failed to read shard {}: {}", info.id, e))?;
        reports.push(ShardReport::new(info, jobs));
    }

    if json {
        let out = serde_json::to_string_pretty(&reports).map_err(|e| miette::miette!("{}", e))?;
        println!("{}", out);
        return Ok(());
    }

    if reports.is_empty() {
        println!("no shards");
    }
    for report in &reports {
        println!(
            "{}  [{}, {})  owner={}  completed={}  jobs={}",
            report.id,
            report.min_time.to_rfc3339(),
            report.max_time.to_rfc3339(),
            report.owner.as_deref().unwrap_or("-"),
            report.completed,
            report.jobs.len()
        );
        for job in &report.jobs {
            println!("  {}  {}  {}  {}", job.due_time.to_rfc3339(), job.id, job.target, job.name);
        }
    }
    Ok(())
}

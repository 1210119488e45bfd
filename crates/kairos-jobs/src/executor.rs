//! Runs the jobs of an assigned shard.
//!
//! The executor pulls due jobs from a shard's consumption stream and hands
//! each one to a [`JobHandler`]. The outcome decides what is written back:
//! a completed job is removed, a failed one is retried later or given up on.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::shard::JobShard;
use crate::types::JobContext;

/// Outcome of one job invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRunResult {
    /// Job finished; remove it.
    Completed,
    /// Job failed; the retry policy decides what happens next.
    Failed(String),
    /// Job is still running elsewhere; ask again after the delay.
    PollAfter(Duration),
}

/// Invokes the target of a job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &JobContext) -> JobRunResult;
}

/// Exponential backoff for failed jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Deliveries allowed before a failing job is dropped.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// When to run a job again after it failed, or `None` to give up.
    pub fn next_attempt(&self, ctx: &JobContext, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if ctx.dequeue_count >= self.max_attempts {
            return None;
        }
        Some(now + chrono::Duration::milliseconds(self.delay(ctx.dequeue_count) as i64))
    }

    /// Backoff in milliseconds after the `attempt`-th failure.
    pub fn delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }
}

/// Executor tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// Jobs of one shard running at the same time.
    pub max_concurrent_jobs: usize,
    pub retry: RetryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 16,
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened while running a shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub delivered: usize,
    pub completed: usize,
    pub retried: usize,
    pub abandoned: usize,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicUsize,
    completed: AtomicUsize,
    retried: AtomicUsize,
    abandoned: AtomicUsize,
}

impl Counters {
    fn summary(&self) -> RunSummary {
        RunSummary {
            delivered: self.delivered.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Drives shards through a [`JobHandler`].
pub struct ShardExecutor {
    handler: Arc<dyn JobHandler>,
    options: ExecutorOptions,
}

impl ShardExecutor {
    pub fn new(handler: Arc<dyn JobHandler>, options: ExecutorOptions) -> Self {
        Self { handler, options }
    }

    /// Run a shard until it drains, is released, or shutdown is signalled.
    ///
    /// Waits for the shard's start time before consuming. On shutdown no new
    /// jobs are pulled; jobs already running are awaited.
    #[tracing::instrument(skip(self, shard, shutdown), fields(shard_id = %shard.id()))]
    pub async fn run_shard(
        &self,
        shard: JobShard,
        mut shutdown: watch::Receiver<bool>,
    ) -> RunSummary {
        let counters = Arc::new(Counters::default());

        let start_in = (shard.min_time() - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !start_in.is_zero() {
            debug!(wait_ms = start_in.as_millis() as u64, "waiting for shard start");
            tokio::select! {
                _ = sleep(start_in) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("shutdown before shard start");
                    return counters.summary();
                }
            }
        }

        info!("running shard");
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_jobs.max(1)));
        let mut tasks = JoinSet::new();
        let mut jobs = shard.consume_durable_jobs();

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("shutdown requested, not starting new jobs");
                    break;
                }
            };

            let ctx = tokio::select! {
                next = jobs.next() => match next {
                    Some(ctx) => ctx,
                    None => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("shutdown requested, not starting new jobs");
                    break;
                }
            };

            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }

            counters.delivered.fetch_add(1, Ordering::Relaxed);
            tasks.spawn(run_job(
                Arc::clone(&self.handler),
                shard.clone(),
                ctx,
                self.options.retry.clone(),
                permit,
                Arc::clone(&counters),
            ));
        }

        drop(jobs);
        while let Some(result) = tasks.join_next().await {
            log_task_result(result);
        }

        let summary = counters.summary();
        info!(
            delivered = summary.delivered,
            completed = summary.completed,
            retried = summary.retried,
            abandoned = summary.abandoned,
            "shard run finished"
        );
        summary
    }
}

async fn run_job(
    handler: Arc<dyn JobHandler>,
    shard: JobShard,
    ctx: JobContext,
    retry: RetryPolicy,
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
) {
    let job_id = ctx.job.id.as_str();
    debug!(job_id, run_id = %ctx.run_id, dequeue_count = ctx.dequeue_count, "running job");

    loop {
        match handler.handle(&ctx).await {
            JobRunResult::Completed => {
                match shard.remove_job(job_id).await {
                    Ok(()) => {
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                        debug!(job_id, "job completed");
                    }
                    Err(e) => warn!(job_id, error = %e, "failed to remove completed job"),
                }
                return;
            }
            JobRunResult::PollAfter(delay) => {
                debug!(
                    job_id,
                    delay_ms = delay.as_millis() as u64,
                    "job still running, polling later"
                );
                sleep(delay).await;
            }
            JobRunResult::Failed(reason) => {
                match retry.next_attempt(&ctx, Utc::now()) {
                    Some(at) => match shard.retry_job_later(&ctx, at).await {
                        Ok(()) => {
                            counters.retried.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                job_id,
                                dequeue_count = ctx.dequeue_count,
                                next_retry = %at,
                                error = %reason,
                                "job failed, scheduled retry"
                            );
                        }
                        Err(e) => warn!(job_id, error = %e, "failed to schedule job retry"),
                    },
                    None => {
                        error!(
                            job_id,
                            dequeue_count = ctx.dequeue_count,
                            error = %reason,
                            "job failed, giving up"
                        );
                        match shard.remove_job(job_id).await {
                            Ok(()) => {
                                counters.abandoned.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => warn!(job_id, error = %e, "failed to remove abandoned job"),
                        }
                    }
                }
                return;
            }
        }
    }
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "job task panicked");
    }
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Job, TargetRef};

    fn ctx(dequeue_count: u32) -> JobContext {
        JobContext {
            job: Job {
                id: "j".to_string(),
                name: "j".to_string(),
                target: TargetRef::new("t"),
                due_time: Utc::now(),
                shard_id: "s".to_string(),
                metadata: None,
            },
            run_id: "r".to_string(),
            dequeue_count,
        }
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            max_attempts: 10,
        };
        assert_eq!(policy.delay(1), 1_000);
        assert_eq!(policy.delay(2), 2_000);
        assert_eq!(policy.delay(3), 4_000);
        assert_eq!(policy.delay(4), 5_000);
        assert_eq!(policy.delay(60), 5_000);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let now = Utc::now();
        assert_eq!(
            policy.next_attempt(&ctx(1), now),
            Some(now + chrono::Duration::seconds(1))
        );
        assert!(policy.next_attempt(&ctx(2), now).is_some());
        assert!(policy.next_attempt(&ctx(3), now).is_none());
    }
}

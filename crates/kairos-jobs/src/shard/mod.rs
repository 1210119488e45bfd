//! An opened, owned job shard.
//!
//! A shard covers a due-time window and is backed by one append-only object.
//! Opening a shard replays its log into a live index. Afterwards every
//! mutation is queued on the shard's writer and resolves once the batch
//! holding it is durable. Removals and retries leave the index right away;
//! new jobs enter it only after their batch commits.

mod index;
mod writer;

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use crate::JobsError;
use crate::operation::{self, JobOperation};
use crate::options::ShardOptions;
use crate::store::ObjectStore;
use crate::types::{Job, JobContext, Metadata, ShardInfo, TargetRef, is_reserved_key};

pub use index::JobIndex;
pub use writer::WriterStats;
use writer::{BatchLimits, WriterHandle};

/// Handle to an opened shard. Clones share the same state.
#[derive(Clone)]
pub struct JobShard {
    inner: Arc<ShardInner>,
}

struct ShardInner {
    id: String,
    info: std::sync::RwLock<ShardInfo>,
    index: RwLock<JobIndex>,
    /// Bumped on every index or lifecycle change; wakes consumers.
    changes: watch::Sender<u64>,
    owned: bool,
    completed: AtomicBool,
    closed: AtomicBool,
    writer: WriterHandle,
}

impl std::fmt::Debug for JobShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobShard")
            .field("id", &self.inner.id)
            .field("owned", &self.inner.owned)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl JobShard {
    /// Open a shard by replaying its log.
    ///
    /// `owned` says whether the local silo holds the shard; an unowned handle
    /// can be inspected but rejects every mutation.
    #[tracing::instrument(skip(store, info, options), fields(shard_id = %info.id))]
    pub(crate) async fn open(
        store: Arc<dyn ObjectStore>,
        info: ShardInfo,
        options: &ShardOptions,
        owned: bool,
    ) -> Result<Self, JobsError> {
        let (data, etag) = store.read(&info.id).await?;

        let mut index = JobIndex::new();
        let mut replayed = 0usize;
        {
            let mut ops = pin!(operation::decode(&data[..], options.max_frame_len));
            while let Some(op) = ops.next().await {
                index.apply(&op?, &info.id);
                replayed += 1;
            }
        }
        debug!(ops = replayed, jobs = index.len(), "replayed shard log");

        let writer = WriterHandle::spawn(
            store,
            info.id.clone(),
            etag,
            BatchLimits {
                min: options.min_batch_size,
                max: options.max_batch_size,
                flush_interval: options.batch_flush_interval(),
            },
        );
        let (changes, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(ShardInner {
                id: info.id.clone(),
                completed: AtomicBool::new(info.completed),
                info: std::sync::RwLock::new(info),
                index: RwLock::new(index),
                changes,
                owned,
                closed: AtomicBool::new(false),
                writer,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn min_time(&self) -> DateTime<Utc> {
        self.info().min_time
    }

    pub fn max_time(&self) -> DateTime<Utc> {
        self.info().max_time
    }

    /// Current durable description of the shard.
    pub fn info(&self) -> ShardInfo {
        match self.inner.info.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// User metadata of the shard.
    pub fn metadata(&self) -> Metadata {
        self.info().metadata
    }

    /// Whether the local silo owns this shard.
    ///
    /// A faulted shard may have been taken over, so it no longer counts as
    /// owned.
    pub fn is_owned(&self) -> bool {
        self.inner.owned && !self.inner.closed.load(Ordering::Acquire) && !self.is_faulted()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Whether a failed write has poisoned this shard.
    pub fn is_faulted(&self) -> bool {
        self.inner.writer.fault().is_some()
    }

    /// Counters of committed log segments.
    pub fn writer_stats(&self) -> &WriterStats {
        self.inner.writer.stats()
    }

    /// Schedule a job in this shard.
    ///
    /// Resolves once the job is durable. The due time must fall in the
    /// shard's `[min_time, max_time)` window.
    #[tracing::instrument(skip(self, target, metadata), fields(shard_id = %self.inner.id))]
    pub async fn try_schedule_job(
        &self,
        target: TargetRef,
        name: &str,
        due_time: DateTime<Utc>,
        metadata: Option<Metadata>,
    ) -> Result<Job, JobsError> {
        let info = self.info();
        if due_time < info.min_time || due_time >= info.max_time {
            return Err(JobsError::OutsideWindow {
                due_time,
                min: info.min_time,
                max: info.max_time,
            });
        }
        self.ensure_writable()?;
        if self.is_completed() {
            return Err(JobsError::ShardCompleted(self.inner.id.clone()));
        }

        let job = Job {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            target,
            due_time,
            shard_id: self.inner.id.clone(),
            metadata,
        };
        let op = JobOperation::add(
            job.id.clone(),
            job.name.clone(),
            job.due_time,
            job.target.clone(),
            job.metadata.clone(),
        );

        // Consumers only ever see a job once it is durable.
        let result = self.inner.writer.append(op).await;
        self.settle(result)?;
        self.inner.index.write().await.insert(job.clone());
        self.notify();

        debug!(job_id = %job.id, due_time = %job.due_time, "scheduled job");
        Ok(job)
    }

    /// Remove a job. Removing an absent job is a no-op.
    #[tracing::instrument(skip(self), fields(shard_id = %self.inner.id))]
    pub async fn remove_job(&self, job_id: &str) -> Result<(), JobsError> {
        self.ensure_writable()?;
        if self.inner.index.write().await.remove(job_id).is_none() {
            debug!("job already absent");
            return Ok(());
        }
        self.notify();
        let result = self.inner.writer.append(JobOperation::remove(job_id)).await;
        self.settle(result)
    }

    /// Put a delivered job back with a new due time.
    ///
    /// The new due time may fall outside the shard's window. Retrying a job
    /// that was removed meanwhile is a no-op.
    #[tracing::instrument(skip(self, ctx), fields(shard_id = %self.inner.id, job_id = %ctx.job.id))]
    pub async fn retry_job_later(
        &self,
        ctx: &JobContext,
        new_due_time: DateTime<Utc>,
    ) -> Result<(), JobsError> {
        self.ensure_writable()?;
        if !self
            .inner
            .index
            .write()
            .await
            .reschedule(&ctx.job.id, new_due_time)
        {
            debug!("retried job no longer present");
            return Ok(());
        }
        self.notify();
        let result = self
            .inner
            .writer
            .append(JobOperation::retry(ctx.job.id.clone(), new_due_time))
            .await;
        self.settle(result)
    }

    /// Stream jobs as they come due, earliest first.
    ///
    /// A delivered job is not delivered again unless it is retried. The
    /// stream ends once the shard is complete and holds no jobs, when the
    /// shard is released, or when a failed write faults it. Dropping the
    /// stream stops consumption.
    pub fn consume_durable_jobs(&self) -> BoxStream<'static, JobContext> {
        let inner = Arc::clone(&self.inner);
        let changes = inner.changes.subscribe();

        stream::unfold((inner, changes), |(inner, mut changes)| async move {
            loop {
                changes.borrow_and_update();
                if !inner.owned || inner.closed.load(Ordering::Acquire) {
                    return None;
                }
                if let Some(reason) = inner.writer.fault() {
                    debug!(shard_id = %inner.id, reason, "shard faulted, ending consumption");
                    return None;
                }

                let now = Utc::now();
                let (next, next_due) = {
                    let mut index = inner.index.write().await;
                    let next = index.take_due(now);
                    let drained = index.is_empty() && inner.completed.load(Ordering::Acquire);
                    if next.is_none() && drained {
                        debug!(shard_id = %inner.id, "shard drained");
                        return None;
                    }
                    (next, index.next_due_time())
                };
                if let Some(ctx) = next {
                    return Some((ctx, (inner, changes)));
                }

                match next_due {
                    Some(due) => {
                        let wait = (due - now).to_std().unwrap_or(Duration::ZERO);
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            changed = changes.changed() => {
                                if changed.is_err() {
                                    return None;
                                }
                            }
                        }
                    }
                    None => {
                        if changes.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        })
        .boxed()
    }

    /// Declare that no further jobs will be added.
    ///
    /// Persists the flag in the shard's metadata. Consumption ends once the
    /// remaining jobs are gone.
    #[tracing::instrument(skip(self), fields(shard_id = %self.inner.id))]
    pub async fn mark_as_complete(&self) -> Result<(), JobsError> {
        self.ensure_writable()?;
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let metadata = self.update_info(|info| info.completed = true);
        self.notify();
        let result = self.inner.writer.update_metadata(metadata).await;
        self.settle(result)?;
        info!("shard marked complete");
        Ok(())
    }

    /// Number of jobs currently held, delivered or not.
    pub async fn job_count(&self) -> usize {
        self.inner.index.read().await.len()
    }

    /// Snapshot of all jobs in due-time order.
    pub async fn jobs(&self) -> Vec<Job> {
        self.inner.index.read().await.jobs()
    }

    /// Merge entries into the shard's user metadata.
    ///
    /// Pending operations are committed first. Keys managed by the scheduler
    /// cannot be set this way.
    #[tracing::instrument(skip(self, metadata), fields(shard_id = %self.inner.id))]
    pub async fn update_metadata(&self, metadata: Metadata) -> Result<(), JobsError> {
        if let Some(key) = metadata.keys().find(|key| is_reserved_key(key)) {
            return Err(JobsError::InvalidMetadata(format!(
                "key {} is managed by the scheduler",
                key
            )));
        }
        self.ensure_writable()?;
        let stored = self.update_info(|info| info.metadata.extend(metadata));
        let result = self.inner.writer.update_metadata(stored).await;
        self.settle(result)
    }

    /// Commit all pending operations now.
    pub async fn flush(&self) -> Result<(), JobsError> {
        self.ensure_writable()?;
        let result = self.inner.writer.flush().await;
        self.settle(result)
    }

    /// Commit pending operations, stop the writer and end consumption.
    pub(crate) async fn stop(&self) -> Result<(), JobsError> {
        let result = self.inner.writer.stop().await;
        self.inner.closed.store(true, Ordering::Release);
        self.notify();
        if let Err(e) = &result {
            warn!(shard_id = %self.inner.id, error = %e, "shard stopped with error");
        }
        result
    }

    fn ensure_writable(&self) -> Result<(), JobsError> {
        if !self.inner.owned {
            return Err(JobsError::NotOwner {
                shard_id: self.inner.id.clone(),
            });
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(JobsError::ShardClosed(self.inner.id.clone()));
        }
        self.inner.writer.check_fault()
    }

    /// Apply a change to the shard info and return the metadata to store.
    fn update_info(&self, change: impl FnOnce(&mut ShardInfo)) -> Metadata {
        let mut info = match self.inner.info.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        change(&mut info);
        info.to_metadata()
    }

    /// Wake consumers when a write failed, so a faulted shard stops delivering.
    fn settle(&self, result: Result<(), JobsError>) -> Result<(), JobsError> {
        if result.is_err() {
            self.notify();
        }
        result
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }
}

//! Batched, conditional writer for one shard log.
//!
//! All writes to a shard object go through a single task, so flushes never
//! overlap and the task is the only holder of the object's current etag.
//! Operations are grouped into batches and each batch is committed as one
//! conditional append. A failed commit faults the shard for good.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, trace};

use crate::JobsError;
use crate::operation::{self, JobOperation};
use crate::store::{ETag, ObjectStore};
use crate::types::Metadata;

/// Capacity of the command channel.
const COMMAND_BUFFER: usize = 1024;

type Ack = oneshot::Sender<Result<(), JobsError>>;

pub(crate) enum WriterCommand {
    /// Queue an operation; acknowledged once its batch is committed.
    Append { op: JobOperation, ack: Ack },
    /// Commit whatever is pending now.
    Flush { ack: Ack },
    /// Commit pending operations, then replace the object's metadata.
    UpdateMetadata { metadata: Metadata, ack: Ack },
    /// Commit pending operations and exit.
    Stop { ack: Ack },
}

/// Counters describing what the writer has committed.
#[derive(Debug, Default)]
pub struct WriterStats {
    segments: AtomicU64,
    operations: AtomicU64,
    largest_segment: AtomicUsize,
}

impl WriterStats {
    /// Number of appends committed.
    pub fn segments(&self) -> u64 {
        self.segments.load(Ordering::Relaxed)
    }

    /// Number of operations committed across all segments.
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Most operations committed in a single append.
    pub fn largest_segment(&self) -> usize {
        self.largest_segment.load(Ordering::Relaxed)
    }

    fn record(&self, ops: usize) {
        self.segments.fetch_add(1, Ordering::Relaxed);
        self.operations.fetch_add(ops as u64, Ordering::Relaxed);
        self.largest_segment.fetch_max(ops, Ordering::Relaxed);
    }
}

/// Batching limits for a writer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchLimits {
    pub min: usize,
    pub max: usize,
    pub flush_interval: Duration,
}

/// Handle to a running writer task.
pub(crate) struct WriterHandle {
    shard_id: String,
    tx: mpsc::Sender<WriterCommand>,
    stats: Arc<WriterStats>,
    fault: Arc<OnceLock<String>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WriterHandle {
    pub(crate) fn spawn(
        store: Arc<dyn ObjectStore>,
        shard_id: String,
        etag: ETag,
        limits: BatchLimits,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let stats = Arc::new(WriterStats::default());
        let fault = Arc::new(OnceLock::new());

        let writer = Writer {
            store,
            shard_id: shard_id.clone(),
            etag,
            limits,
            pending: Vec::new(),
            stats: Arc::clone(&stats),
            fault: Arc::clone(&fault),
        };
        let task = tokio::spawn(writer.run(rx));

        Self {
            shard_id,
            tx,
            stats,
            fault,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    pub(crate) fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Reason the shard faulted, if it has.
    pub(crate) fn fault(&self) -> Option<&str> {
        self.fault.get().map(String::as_str)
    }

    pub(crate) fn check_fault(&self) -> Result<(), JobsError> {
        match self.fault() {
            Some(reason) => Err(self.faulted(reason)),
            None => Ok(()),
        }
    }

    pub(crate) async fn append(&self, op: JobOperation) -> Result<(), JobsError> {
        self.send(|ack| WriterCommand::Append { op, ack }).await
    }

    pub(crate) async fn flush(&self) -> Result<(), JobsError> {
        self.send(|ack| WriterCommand::Flush { ack }).await
    }

    pub(crate) async fn update_metadata(&self, metadata: Metadata) -> Result<(), JobsError> {
        self.send(|ack| WriterCommand::UpdateMetadata { metadata, ack })
            .await
    }

    /// Commit pending operations and wait for the task to exit.
    pub(crate) async fn stop(&self) -> Result<(), JobsError> {
        let result = match self.send(|ack| WriterCommand::Stop { ack }).await {
            Err(JobsError::ShardClosed(_)) => Ok(()),
            other => other,
        };
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(shard_id = %self.shard_id, error = %e, "shard writer task panicked");
            }
        }
        result
    }

    async fn send(&self, command: impl FnOnce(Ack) -> WriterCommand) -> Result<(), JobsError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(command(ack))
            .await
            .map_err(|_| JobsError::ShardClosed(self.shard_id.clone()))?;
        done.await
            .map_err(|_| JobsError::ShardClosed(self.shard_id.clone()))?
    }

    fn faulted(&self, reason: &str) -> JobsError {
        JobsError::ShardFaulted {
            shard_id: self.shard_id.clone(),
            reason: reason.to_string(),
        }
    }
}

struct Writer {
    store: Arc<dyn ObjectStore>,
    shard_id: String,
    etag: ETag,
    limits: BatchLimits,
    pending: Vec<(JobOperation, Ack)>,
    stats: Arc<WriterStats>,
    fault: Arc<OnceLock<String>>,
}

/// What the batch loop should do after collecting.
enum Next {
    Continue,
    Exit,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<WriterCommand>) {
        debug!(shard_id = %self.shard_id, "shard writer started");

        while let Some(command) = rx.recv().await {
            let next = match command {
                WriterCommand::Append { op, ack } => {
                    self.pending.push((op, ack));
                    self.collect_batch(&mut rx).await
                }
                other => self.handle_control(other).await,
            };
            if let Next::Exit = next {
                break;
            }
        }

        // Channel closed or stop requested: nothing may be left waiting.
        let _ = self.commit().await;
        debug!(shard_id = %self.shard_id, "shard writer stopped");
    }

    /// Grow the open batch until it is big enough, then commit it.
    ///
    /// A batch of at least `min` operations commits as soon as no more
    /// operations are immediately queued. A smaller batch waits up to the
    /// flush interval for company. A batch never exceeds `max`.
    async fn collect_batch(&mut self, rx: &mut mpsc::Receiver<WriterCommand>) -> Next {
        let deadline = Instant::now() + self.limits.flush_interval;

        loop {
            while self.pending.len() < self.limits.max {
                match rx.try_recv() {
                    Ok(WriterCommand::Append { op, ack }) => self.pending.push((op, ack)),
                    Ok(other) => return self.handle_control(other).await,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        let _ = self.commit().await;
                        return Next::Exit;
                    }
                }
            }

            if self.pending.len() >= self.limits.min {
                let _ = self.commit().await;
                return Next::Continue;
            }

            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(WriterCommand::Append { op, ack })) => self.pending.push((op, ack)),
                Ok(Some(other)) => return self.handle_control(other).await,
                Ok(None) => {
                    let _ = self.commit().await;
                    return Next::Exit;
                }
                Err(_) => {
                    trace!(
                        shard_id = %self.shard_id,
                        pending = self.pending.len(),
                        "flush interval elapsed with undersized batch"
                    );
                    let _ = self.commit().await;
                    return Next::Continue;
                }
            }
        }
    }

    /// Forced flush, metadata write or stop. Pending operations commit first.
    async fn handle_control(&mut self, command: WriterCommand) -> Next {
        match command {
            WriterCommand::Append { op, ack } => {
                self.pending.push((op, ack));
                Next::Continue
            }
            WriterCommand::Flush { ack } => {
                let _ = ack.send(self.commit().await);
                Next::Continue
            }
            WriterCommand::UpdateMetadata { metadata, ack } => {
                let result = match self.commit().await {
                    Ok(()) => self.write_metadata(&metadata).await,
                    Err(e) => Err(e),
                };
                let _ = ack.send(result);
                Next::Continue
            }
            WriterCommand::Stop { ack } => {
                let _ = ack.send(self.commit().await);
                Next::Exit
            }
        }
    }

    /// Commit all pending operations as one conditional append.
    async fn commit(&mut self) -> Result<(), JobsError> {
        if let Some(reason) = self.fault.get() {
            let reason = reason.clone();
            for (_, ack) in self.pending.drain(..) {
                let _ = ack.send(Err(faulted(&self.shard_id, &reason)));
            }
            return Err(faulted(&self.shard_id, &reason));
        }
        if self.pending.is_empty() {
            return Ok(());
        }

        let batch: Vec<(JobOperation, Ack)> = self.pending.drain(..).collect();
        let count = batch.len();

        let result = match operation::encode_batch(batch.iter().map(|(op, _)| op)) {
            Ok(block) => self
                .store
                .append(&self.shard_id, &block, self.etag)
                .await
                .map_err(JobsError::from),
            Err(e) => Err(JobsError::from(e)),
        };

        match result {
            Ok(etag) => {
                self.etag = etag;
                self.stats.record(count);
                trace!(shard_id = %self.shard_id, ops = count, "committed batch");
                for (_, ack) in batch {
                    let _ = ack.send(Ok(()));
                }
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                error!(
                    shard_id = %self.shard_id,
                    ops = count,
                    error = %reason,
                    "batch commit failed, shard faulted"
                );
                let _ = self.fault.set(reason.clone());
                for (_, ack) in batch {
                    let _ = ack.send(Err(faulted(&self.shard_id, &reason)));
                }
                Err(e)
            }
        }
    }

    async fn write_metadata(&mut self, metadata: &Metadata) -> Result<(), JobsError> {
        if let Some(reason) = self.fault.get() {
            return Err(faulted(&self.shard_id, reason));
        }
        match self
            .store
            .set_metadata(&self.shard_id, metadata, self.etag)
            .await
        {
            Ok(etag) => {
                self.etag = etag;
                debug!(shard_id = %self.shard_id, "updated shard metadata");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                error!(
                    shard_id = %self.shard_id,
                    error = %reason,
                    "metadata write failed, shard faulted"
                );
                let _ = self.fault.set(reason);
                Err(e.into())
            }
        }
    }
}

fn faulted(shard_id: &str, reason: &str) -> JobsError {
    JobsError::ShardFaulted {
        shard_id: shard_id.to_string(),
        reason: reason.to_string(),
    }
}

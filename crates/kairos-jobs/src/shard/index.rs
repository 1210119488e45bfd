//! Live due-time index of an opened shard.
//!
//! The index is the fold of the shard's operation log: `Add` inserts,
//! `Remove` deletes, `Retry` moves a job to a new due time. Jobs handed to a
//! consumer stay counted but leave the ready queue until they are removed or
//! retried.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::operation::JobOperation;
use crate::types::{Job, JobContext};

/// Position in the ready queue: due time, then append order.
type QueueKey = (DateTime<Utc>, u64);

#[derive(Debug, Clone)]
struct Entry {
    job: Job,
    key: QueueKey,
    queued: bool,
    dequeue_count: u32,
}

#[derive(Debug, Default)]
pub struct JobIndex {
    jobs: HashMap<String, Entry>,
    queue: BTreeMap<QueueKey, String>,
    next_seq: u64,
}

impl JobIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one log operation into the index.
    ///
    /// Returns whether the index changed.
    pub fn apply(&mut self, op: &JobOperation, shard_id: &str) -> bool {
        match op {
            JobOperation::Add {
                id,
                name,
                due_time,
                target,
                metadata,
            } => {
                self.insert(Job {
                    id: id.clone(),
                    name: name.clone(),
                    target: target.clone(),
                    due_time: *due_time,
                    shard_id: shard_id.to_string(),
                    metadata: metadata.clone(),
                });
                true
            }
            JobOperation::Remove { id } => self.remove(id).is_some(),
            JobOperation::Retry { id, due_time } => self.reschedule(id, *due_time),
        }
    }

    /// Insert a job, replacing any job with the same id.
    pub fn insert(&mut self, job: Job) {
        self.remove(&job.id);
        let key = self.next_key(job.due_time);
        self.queue.insert(key, job.id.clone());
        self.jobs.insert(
            job.id.clone(),
            Entry {
                job,
                key,
                queued: true,
                dequeue_count: 0,
            },
        );
    }

    pub fn remove(&mut self, id: &str) -> Option<Job> {
        let entry = self.jobs.remove(id)?;
        if entry.queued {
            self.queue.remove(&entry.key);
        }
        Some(entry.job)
    }

    /// Move a job to `due_time` and put it back in the ready queue.
    pub fn reschedule(&mut self, id: &str, due_time: DateTime<Utc>) -> bool {
        let key = self.next_key(due_time);
        let Some(entry) = self.jobs.get_mut(id) else {
            return false;
        };
        if entry.queued {
            self.queue.remove(&entry.key);
        }
        entry.job.due_time = due_time;
        entry.key = key;
        entry.queued = true;
        self.queue.insert(key, id.to_string());
        true
    }

    /// Hand out the earliest job if it is due at `now`.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Option<JobContext> {
        let (&key, _) = self.queue.first_key_value()?;
        if key.0 > now {
            return None;
        }
        let (_, id) = self.queue.pop_first()?;
        let entry = self.jobs.get_mut(&id)?;
        entry.queued = false;
        entry.dequeue_count += 1;
        Some(JobContext {
            job: entry.job.clone(),
            run_id: uuid::Uuid::new_v4().to_string(),
            dequeue_count: entry.dequeue_count,
        })
    }

    /// Due time of the earliest queued job.
    pub fn next_due_time(&self) -> Option<DateTime<Utc>> {
        self.queue.first_key_value().map(|(key, _)| key.0)
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id).map(|entry| &entry.job)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    /// All jobs, queued or handed out.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs waiting in the ready queue.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Every job in due-time order, ties broken by append order.
    pub fn jobs(&self) -> Vec<Job> {
        let mut entries: Vec<&Entry> = self.jobs.values().collect();
        entries.sort_by_key(|entry| entry.key);
        entries.into_iter().map(|entry| entry.job.clone()).collect()
    }

    fn next_key(&mut self, due_time: DateTime<Utc>) -> QueueKey {
        self.next_seq += 1;
        (due_time, self.next_seq)
    }
}

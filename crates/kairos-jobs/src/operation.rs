//! Operations persisted to a shard's log.
//!
//! A shard log is a sequence of netstring-framed JSON documents, one
//! [`JobOperation`] per frame, replayed in append order.

use chrono::{DateTime, Utc};
use futures_util::Stream;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::netstring::{self, NetstringReader};
use crate::types::{Metadata, TargetRef};
use crate::JobsError;

/// A single log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOperation {
    /// Create a job.
    Add {
        id: String,
        name: String,
        due_time: DateTime<Utc>,
        target: TargetRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
    /// Cancel or acknowledge a job.
    Remove { id: String },
    /// Move a job to a new due time.
    Retry { id: String, due_time: DateTime<Utc> },
}

impl JobOperation {
    pub fn add(
        id: impl Into<String>,
        name: impl Into<String>,
        due_time: DateTime<Utc>,
        target: TargetRef,
        metadata: Option<Metadata>,
    ) -> Self {
        JobOperation::Add {
            id: id.into(),
            name: name.into(),
            due_time,
            target,
            metadata,
        }
    }

    pub fn remove(id: impl Into<String>) -> Self {
        JobOperation::Remove { id: id.into() }
    }

    pub fn retry(id: impl Into<String>, due_time: DateTime<Utc>) -> Self {
        JobOperation::Retry {
            id: id.into(),
            due_time,
        }
    }

    /// The job this operation applies to.
    pub fn id(&self) -> &str {
        match self {
            JobOperation::Add { id, .. }
            | JobOperation::Remove { id }
            | JobOperation::Retry { id, .. } => id,
        }
    }
}

/// Encode one operation as a framed JSON record.
pub fn encode(op: &JobOperation) -> Result<Vec<u8>, serde_json::Error> {
    Ok(netstring::encode(&serde_json::to_vec(op)?))
}

/// Encode a batch of operations into one contiguous block.
pub fn encode_batch<'a>(
    ops: impl IntoIterator<Item = &'a JobOperation>,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut block = Vec::new();
    for op in ops {
        netstring::encode_into(&serde_json::to_vec(op)?, &mut block);
    }
    Ok(block)
}

/// Decode a shard log into a lazy sequence of operations.
///
/// The first framing or JSON error is yielded and ends the sequence; corrupt
/// records are never skipped.
pub fn decode<R>(
    reader: R,
    max_frame_len: usize,
) -> impl Stream<Item = Result<JobOperation, JobsError>>
where
    R: AsyncRead + Unpin,
{
    stream::unfold(
        Some(NetstringReader::with_max_len(reader, max_frame_len)),
        |state| async move {
            let mut reader = state?;
            match reader.next_frame().await {
                Ok(Some(frame)) => match serde_json::from_slice::<JobOperation>(&frame) {
                    Ok(op) => Some((Ok(op), Some(reader))),
                    Err(e) => Some((Err(JobsError::Json(e)), None)),
                },
                Ok(None) => None,
                Err(e) => Some((Err(JobsError::Framing(e)), None)),
            }
        },
    )
}

//! Netstring framing for shard logs.
//!
//! Each record is written as `{len}:{payload}\n`, where `len` is the decimal
//! byte length of the payload. Decoding is forward-only: a reader consumes
//! records in order and stops at the first malformed one.

use futures_util::Stream;
use futures_util::stream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length tokens longer than this cannot be valid (`u64::MAX` has 20 digits).
const MAX_LENGTH_DIGITS: usize = 20;

/// Errors raised while decoding a netstring stream.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The length prefix was not a decimal number.
    #[error("invalid netstring length: {0}")]
    InvalidLength(String),

    /// The length prefix was negative or larger than the configured maximum.
    #[error("netstring length out of valid range: {len} (max {max})")]
    LengthOutOfRange { len: i128, max: usize },

    /// The stream ended inside a record.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The payload was not followed by `\n`.
    #[error("expected newline at end of netstring, got byte value {0}")]
    MissingSeparator(u8),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for FramingError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FramingError::UnexpectedEof
        } else {
            FramingError::Io(e)
        }
    }
}

/// Frame a payload as a netstring.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let prefix = payload.len().to_string();
    let mut out = Vec::with_capacity(prefix.len() + payload.len() + 2);
    out.extend_from_slice(prefix.as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(b'\n');
    out
}

/// Append a framed payload to an existing buffer.
pub fn encode_into(payload: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(b'\n');
}

/// Incremental netstring reader over an async byte stream.
pub struct NetstringReader<R> {
    inner: BufReader<R>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> NetstringReader<R> {
    /// Create a reader with the default frame limit.
    pub fn new(reader: R) -> Self {
        Self::with_max_len(reader, DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a reader that rejects frames larger than `max_len` bytes.
    pub fn with_max_len(reader: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_len,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` at a clean end of stream (no partial length token).
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let Some(len) = self.read_length().await? else {
            return Ok(None);
        };

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;

        let mut separator = [0u8; 1];
        if self.inner.read(&mut separator).await? == 0 {
            return Err(FramingError::UnexpectedEof);
        }
        if separator[0] != b'\n' {
            return Err(FramingError::MissingSeparator(separator[0]));
        }

        Ok(Some(payload))
    }

    async fn read_length(&mut self) -> Result<Option<usize>, FramingError> {
        let mut token = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            if self.inner.read(&mut byte).await? == 0 {
                if token.is_empty() {
                    return Ok(None);
                }
                return Err(FramingError::UnexpectedEof);
            }
            if byte[0] == b':' {
                break;
            }
            token.push(byte[0]);
            if token.len() > MAX_LENGTH_DIGITS {
                return Err(FramingError::InvalidLength(
                    String::from_utf8_lossy(&token).into_owned(),
                ));
            }
        }

        let text = String::from_utf8_lossy(&token).into_owned();
        let digits = token.strip_prefix(b"-").unwrap_or(&token[..]);
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(FramingError::InvalidLength(text));
        }
        let parsed: i128 = text
            .parse()
            .map_err(|_| FramingError::InvalidLength(text.clone()))?;
        if parsed < 0 || parsed > self.max_len as i128 {
            return Err(FramingError::LengthOutOfRange {
                len: parsed,
                max: self.max_len,
            });
        }
        Ok(Some(parsed as usize))
    }
}

/// Decode a byte stream into a lazy sequence of payloads.
///
/// The sequence ends after the first error.
pub fn decode<R>(reader: R) -> impl Stream<Item = Result<Vec<u8>, FramingError>>
where
    R: AsyncRead + Unpin,
{
    decode_with_max_len(reader, DEFAULT_MAX_FRAME_LEN)
}

/// [`decode`] with an explicit frame limit.
pub fn decode_with_max_len<R>(
    reader: R,
    max_len: usize,
) -> impl Stream<Item = Result<Vec<u8>, FramingError>>
where
    R: AsyncRead + Unpin,
{
    stream::unfold(
        Some(NetstringReader::with_max_len(reader, max_len)),
        |state| async move {
            let mut reader = state?;
            match reader.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        },
    )
}

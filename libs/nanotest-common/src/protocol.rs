//! Wire protocol between the host and its workers.
//!
//! Defines only semantics shared by both ends, not runtime logic: the message
//! kinds, which of them are requests and which terminate a request, and the
//! framing. Keeping this in one place guarantees the parent and the worker
//! decode with the same table.
//!
//! **Framing:** every message is a 4-byte big-endian length followed by a JSON
//! record `{"id": <correlation id>, "body": {"kind": <discriminator>,
//! "payload": ...}}`. Records larger than [`MAX_FRAME_BYTES`] are rejected.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::device::Device;
use crate::types::{ClassTestPlan, Diagnostic, OutcomeReport, TestCollection, TraitFilter};

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single record (16 MiB)
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Correlation id pairing a request with its notifications and terminal reply.
/// Id 0 is used for messages that belong to no request.
pub type CorrelationId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: CorrelationId,
    pub body: MessageBody,
}

impl Message {
    pub fn new(id: CorrelationId, body: MessageBody) -> Self {
        Self { id, body }
    }

    /// Message not tied to any request
    pub fn unsolicited(body: MessageBody) -> Self {
        Self { id: 0, body }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum MessageBody {
    Hello(Hello),
    Discover(DiscoverRequest),
    DiscoveryProgress(AssemblyDiscovery),
    DiscoveryComplete(DiscoverySummary),
    Execute(ExecuteRequest),
    OutcomeReported(OutcomeReport),
    ExecutionComplete(ExecutionSummary),
    /// Cancel the request carrying the same correlation id
    Cancel,
    /// Terminal acknowledgement of a cancelled request
    Cancelled,
    Failure(Failure),
    Log(LogRecord),
    /// Stop the dispatch loop and exit
    Shutdown,
}

impl MessageBody {
    /// Discriminator table, identical on both ends of a channel
    pub const KINDS: &'static [&'static str] = &[
        "Hello",
        "Discover",
        "DiscoveryProgress",
        "DiscoveryComplete",
        "Execute",
        "OutcomeReported",
        "ExecutionComplete",
        "Cancel",
        "Cancelled",
        "Failure",
        "Log",
        "Shutdown",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Hello(_) => "Hello",
            MessageBody::Discover(_) => "Discover",
            MessageBody::DiscoveryProgress(_) => "DiscoveryProgress",
            MessageBody::DiscoveryComplete(_) => "DiscoveryComplete",
            MessageBody::Execute(_) => "Execute",
            MessageBody::OutcomeReported(_) => "OutcomeReported",
            MessageBody::ExecutionComplete(_) => "ExecutionComplete",
            MessageBody::Cancel => "Cancel",
            MessageBody::Cancelled => "Cancelled",
            MessageBody::Failure(_) => "Failure",
            MessageBody::Log(_) => "Log",
            MessageBody::Shutdown => "Shutdown",
        }
    }

    /// Messages that open a request and expect exactly one terminal reply
    pub fn is_request(&self) -> bool {
        matches!(self, MessageBody::Discover(_) | MessageBody::Execute(_))
    }

    /// Replies that close a request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageBody::DiscoveryComplete(_)
                | MessageBody::ExecutionComplete(_)
                | MessageBody::Cancelled
                | MessageBody::Failure(_)
        )
    }

    /// Messages routed to the request that owns their correlation id
    pub fn is_reply(&self) -> bool {
        self.is_terminal()
            || matches!(
                self,
                MessageBody::DiscoveryProgress(_) | MessageBody::OutcomeReported(_)
            )
    }
}

/// Handshake sent by both ends before anything else
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub kinds: Vec<String>,
    pub session: String,
}

impl Hello {
    pub fn current(session: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            kinds: MessageBody::KINDS.iter().map(|k| k.to_string()).collect(),
            session: session.into(),
        }
    }

    /// Explain why the peer's table differs from ours, if it does
    pub fn mismatch(&self, peer: &Hello) -> Option<String> {
        if self.protocol_version != peer.protocol_version {
            return Some(format!(
                "protocol version mismatch: local {}, peer {}",
                self.protocol_version, peer.protocol_version
            ));
        }
        if self.kinds != peer.kinds {
            return Some(format!(
                "message kind table mismatch: local {:?}, peer {:?}",
                self.kinds, peer.kinds
            ));
        }
        None
    }
}

/// Where discovery runs and what it keeps
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Relative assembly paths resolve against this directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub filter: TraitFilter,
}

impl ProjectContext {
    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub assemblies: Vec<PathBuf>,
    #[serde(default)]
    pub context: ProjectContext,
}

/// Everything discovered in one assembly
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssemblyDiscovery {
    pub assembly: String,
    pub collection: TestCollection,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySummary {
    pub assemblies: usize,
    pub tests: usize,
}

/// Run one class plan (already narrowed to the tests scheduled here) on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub plan: ClassTestPlan,
    pub device: Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub reported: usize,
    pub aborted: bool,
}

/// Fatal error report closing a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Transport-level failure; the stream cannot be resynchronised after one
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("stream ended in the middle of a frame")]
    Truncated,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A well-framed record that does not decode. The correlation id is kept
/// when it could be read so the owning request can be failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("undecodable record (id {id:?}): {reason}")]
pub struct RecordError {
    pub id: Option<CorrelationId>,
    pub reason: String,
}

#[derive(Deserialize)]
struct RawRecord {
    id: CorrelationId,
    body: serde_json::Value,
}

/// Serialize a message into a length-prefixed frame
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, FrameError> {
    let record = serde_json::to_vec(message)?;
    if record.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            len: record.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let mut frame = Vec::with_capacity(4 + record.len());
    frame.extend_from_slice(&(record.len() as u32).to_be_bytes());
    frame.extend_from_slice(&record);
    Ok(frame)
}

/// Decode one record. Unknown discriminators are rejected.
pub fn decode_record(record: &[u8]) -> Result<Message, RecordError> {
    let raw: RawRecord = serde_json::from_slice(record).map_err(|e| RecordError {
        id: None,
        reason: e.to_string(),
    })?;
    let body: MessageBody = serde_json::from_value(raw.body).map_err(|e| RecordError {
        id: Some(raw.id),
        reason: e.to_string(),
    })?;
    Ok(Message { id: raw.id, body })
}

pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next record. `Ok(None)` is a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut record = vec![0u8; len];
    match reader.read_exact(&mut record).await {
        Ok(_) => Ok(Some(record)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
        Err(e) => Err(FrameError::Io(e)),
    }
}

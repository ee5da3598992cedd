//! Host/worker wire protocol: one JSON document per line.
//!
//! The host writes a [`WorkerRequest`] to a fresh-process worker's stdin and
//! then answers token requests. The worker writes [`WorkerMessage`]s to its
//! stdout, ending with exactly one `finished` message.

use std::io::{BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditSinkSpec, Event};
use crate::capability::CapabilitySpec;
use crate::error::ErrorInfo;
use crate::policy::Policy;
use crate::result::RunMetrics;
use crate::roots::RootSpec;

pub const PROTOCOL_VERSION: u32 = 1;

/// How a worker process is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Duplicate the host with `fork`; live objects are inherited.
    Fork,
    /// Start the worker binary and rebuild everything from descriptors.
    #[default]
    Spawn,
}

impl ProcessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessMode::Fork => "fork",
            ProcessMode::Spawn => "spawn",
        }
    }
}

/// Everything a worker needs to run one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub version: u32,
    pub execution_id: String,
    pub code: String,
    pub policy: Policy,
    #[serde(default)]
    pub capabilities: Vec<CapabilitySpec>,
    #[serde(default)]
    pub roots: Vec<RootSpec>,
    #[serde(default)]
    pub inputs: Option<serde_json::Value>,
    pub mode: ProcessMode,
    /// Worker-side sinks only; host-side sinks are replayed by the host.
    #[serde(default)]
    pub audit_sinks: Vec<AuditSinkSpec>,
}

/// What a worker reports when it is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub ok: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub locals: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub metrics: RunMetrics,
    /// The script's `__stats__`.
    #[serde(default)]
    pub user_stats: serde_json::Value,
}

impl WorkerOutcome {
    pub fn failure(error: ErrorInfo, events: Vec<Event>, metrics: RunMetrics) -> Self {
        Self {
            ok: false,
            result: serde_json::Value::Null,
            locals: serde_json::Map::new(),
            error: Some(error),
            events,
            metrics,
            user_stats: serde_json::Value::Null,
        }
    }
}

/// Worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Draw `n` tokens from the host-owned ledgers. `init_exec` seeds an
    /// unset exec scope first.
    ConsumeTokens {
        capability: String,
        n: u64,
        #[serde(default)]
        init_exec: Option<u64>,
    },
    /// One envelope for the host's stdout audit sink.
    AuditLine { line: String },
    Finished { outcome: Box<WorkerOutcome> },
}

/// Host to worker, in answer to `consume_tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostReply {
    TokensGranted,
    TokensDenied { needed: u64, available: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed protocol message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("protocol line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("unsupported protocol version {0}")]
    Version(u32),
}

/// Longest line either side accepts.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::LineTooLong(MAX_LINE_BYTES));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Write one message and flush.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ProtocolError> {
    writer.write_all(encode_line(message)?.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read one message; `None` at end of stream.
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, ProtocolError> {
    let mut line = String::new();
    let n = std::io::Read::take(&mut *reader, MAX_LINE_BYTES as u64 + 1).read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    decode_line(&line).map(Some)
}

impl WorkerRequest {
    pub fn check_version(&self) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::Version(self.version));
        }
        Ok(())
    }
}

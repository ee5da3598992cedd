//! Audit events and sinks.
//!
//! Every event produced by an execution is recorded in order on an
//! [`AuditStream`] and fanned out to its sinks. Sink failures are logged and
//! swallowed; auditing never fails an execution.
//!
//! Sinks split by where they run. `stdout`, `file` and `webhook` run inside
//! the worker as events happen (stdout lines travel to the host over the
//! worker protocol). `memory` and `otel` run on the host and receive the
//! events of each finished execution.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Milliseconds since the worker clock started.
    pub ts_ms: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(ts_ms: u64, kind: &str, data: serde_json::Value) -> Self {
        Self {
            ts_ms,
            kind: kind.to_string(),
            data,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit webhook error: {0}")]
    Webhook(String),

    #[error("audit sink '{0}' cannot run inside the worker")]
    HostOnly(&'static str),

    #[error("invalid audit sink: {0}")]
    Invalid(String),
}

/// An event together with the execution it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct AuditRecord<'a> {
    pub execution_id: &'a str,
    pub event: &'a Event,
}

impl AuditRecord<'_> {
    /// Envelope written by line-oriented sinks.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "execution_id": self.execution_id,
            "recorded_at": chrono::Utc::now().to_rfc3339(),
            "ts_ms": self.event.ts_ms,
            "type": self.event.kind,
            "data": self.event.data,
        })
    }
}

/// Destination for audit events. Implementations must tolerate concurrent
/// writers.
pub trait AuditSink: Send + Sync {
    fn kind(&self) -> &'static str;

    fn emit(&self, record: AuditRecord<'_>) -> Result<(), AuditError>;
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(String, Event)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, with their execution ids.
    pub fn records(&self) -> Vec<(String, Event)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.records().into_iter().map(|(_, e)| e).collect()
    }
}

impl AuditSink for MemorySink {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn emit(&self, record: AuditRecord<'_>) -> Result<(), AuditError> {
        if let Ok(mut events) = self.events.lock() {
            events.push((record.execution_id.to_string(), record.event.clone()));
        }
        Ok(())
    }
}

/// Receives one serialized envelope per call.
pub type LineWriter = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

/// Line writer for this process's stdout.
pub fn stdout_writer() -> LineWriter {
    Arc::new(|line: &str| {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}")?;
        out.flush()
    })
}

/// Writes one JSON line per event through a [`LineWriter`].
pub struct StdoutSink {
    writer: LineWriter,
}

impl StdoutSink {
    /// Sink writing to this process's stdout.
    pub fn process_stdout() -> Self {
        Self::with_writer(stdout_writer())
    }

    pub fn with_writer(writer: LineWriter) -> Self {
        Self { writer }
    }
}

impl AuditSink for StdoutSink {
    fn kind(&self) -> &'static str {
        "stdout"
    }

    fn emit(&self, record: AuditRecord<'_>) -> Result<(), AuditError> {
        let line = serde_json::to_string(&record.envelope())?;
        (self.writer)(&line)?;
        Ok(())
    }
}

/// Appends JSON lines to a file. Whole lines are written under a mutex.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileSink {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn emit(&self, record: AuditRecord<'_>) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&record.envelope())?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| AuditError::Io(std::io::Error::other("file sink lock poisoned")))?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// POSTs each envelope to a URL with a bounded timeout.
///
/// The HTTP client is built lazily and rebuilt when the process id changes,
/// so a sink shared into a forked worker never reuses the parent's
/// connection pool.
pub struct WebhookSink {
    url: String,
    timeout: Duration,
    client: Mutex<Option<(u32, reqwest::blocking::Client)>>,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout_s: f64) -> Result<Self, AuditError> {
        Ok(Self {
            url: url.into(),
            timeout: webhook_timeout(timeout_s)?,
            client: Mutex::new(None),
        })
    }

    fn client(&self) -> Result<reqwest::blocking::Client, AuditError> {
        let pid = std::process::id();
        let mut slot = self
            .client
            .lock()
            .map_err(|_| AuditError::Webhook("client lock poisoned".into()))?;
        if let Some((owner, client)) = slot.as_ref() {
            if *owner == pid {
                return Ok(client.clone());
            }
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| AuditError::Webhook(e.to_string()))?;
        *slot = Some((pid, client.clone()));
        Ok(client)
    }
}

impl AuditSink for WebhookSink {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    fn emit(&self, record: AuditRecord<'_>) -> Result<(), AuditError> {
        let response = self
            .client()?
            .post(&self.url)
            .json(&record.envelope())
            .send()
            .map_err(|e| AuditError::Webhook(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuditError::Webhook(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Emits each event as a `tracing` event tagged with a service name, for
/// collection by an OpenTelemetry-aware subscriber.
pub struct TracingSink {
    service_name: String,
}

impl TracingSink {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

impl AuditSink for TracingSink {
    fn kind(&self) -> &'static str {
        "otel"
    }

    fn emit(&self, record: AuditRecord<'_>) -> Result<(), AuditError> {
        tracing::info!(
            target: "cordon::audit",
            event = "audit.event",
            service = %self.service_name,
            execution_id = %record.execution_id,
            event_type = %record.event.kind,
            ts_ms = record.event.ts_ms,
            data = %record.event.data,
        );
        Ok(())
    }
}

/// Sub-millisecond timeouts round up to one millisecond.
fn webhook_timeout(timeout_s: f64) -> Result<Duration, AuditError> {
    if timeout_s.is_nan() || timeout_s <= 0.0 {
        return Err(AuditError::Invalid(format!(
            "webhook timeout_s must be positive, got {timeout_s}"
        )));
    }
    Duration::try_from_secs_f64(timeout_s.max(0.001))
        .map_err(|e| AuditError::Invalid(format!("webhook timeout_s {timeout_s}: {e}")))
}

fn default_timeout_s() -> f64 {
    1.0
}

fn default_service_name() -> String {
    "cordon".to_string()
}

/// Declarative sink descriptor, usable in every process mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditSinkSpec {
    Memory,
    Stdout,
    File {
        path: PathBuf,
    },
    Webhook {
        url: String,
        #[serde(default = "default_timeout_s")]
        timeout_s: f64,
    },
    Otel {
        #[serde(default = "default_service_name")]
        service_name: String,
    },
}

impl AuditSinkSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditSinkSpec::Memory => "memory",
            AuditSinkSpec::Stdout => "stdout",
            AuditSinkSpec::File { .. } => "file",
            AuditSinkSpec::Webhook { .. } => "webhook",
            AuditSinkSpec::Otel { .. } => "otel",
        }
    }

    /// Sinks that receive finished executions on the host.
    pub fn is_host_side(&self) -> bool {
        matches!(self, AuditSinkSpec::Memory | AuditSinkSpec::Otel { .. })
    }

    /// Reject descriptors that could never build a sink.
    pub fn validate(&self) -> Result<(), AuditError> {
        match self {
            AuditSinkSpec::Webhook { url, timeout_s } => {
                if url.is_empty() {
                    return Err(AuditError::Invalid("webhook url is empty".into()));
                }
                webhook_timeout(*timeout_s).map(|_| ())
            }
            AuditSinkSpec::File { path } if path.as_os_str().is_empty() => {
                Err(AuditError::Invalid("file sink path is empty".into()))
            }
            _ => Ok(()),
        }
    }

    /// Build a worker-side sink. `stdout` carries lines to the host.
    pub fn build_worker_sink(&self, stdout: &LineWriter) -> Result<Arc<dyn AuditSink>, AuditError> {
        Ok(match self {
            AuditSinkSpec::Stdout => Arc::new(StdoutSink::with_writer(stdout.clone())),
            AuditSinkSpec::File { path } => Arc::new(FileSink::open(path)?),
            AuditSinkSpec::Webhook { url, timeout_s } => Arc::new(WebhookSink::new(url, *timeout_s)?),
            AuditSinkSpec::Memory | AuditSinkSpec::Otel { .. } => {
                return Err(AuditError::HostOnly(self.kind()))
            }
        })
    }
}

/// Ordered event log of one execution inside the worker.
pub struct AuditStream {
    execution_id: String,
    sinks: Vec<Arc<dyn AuditSink>>,
    events: RefCell<Vec<Event>>,
}

impl AuditStream {
    pub fn new(execution_id: impl Into<String>, sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self {
            execution_id: execution_id.into(),
            sinks,
            events: RefCell::new(Vec::new()),
        }
    }

    /// Stream with no sinks; events are only recorded.
    pub fn in_memory() -> Self {
        Self::new("local", Vec::new())
    }

    pub fn emit(&self, event: Event) {
        let record = AuditRecord {
            execution_id: &self.execution_id,
            event: &event,
        };
        for sink in &self.sinks {
            if let Err(e) = sink.emit(record) {
                tracing::warn!(event = "audit.sink_failed", sink = sink.kind(), error = %e);
            }
        }
        self.events.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}

/// Deliver finished events to host-side sinks.
pub fn replay(sinks: &[Arc<dyn AuditSink>], execution_id: &str, events: &[Event]) {
    for event in events {
        let record = AuditRecord {
            execution_id,
            event,
        };
        for sink in sinks {
            if let Err(e) = sink.emit(record) {
                tracing::warn!(event = "audit.sink_failed", sink = sink.kind(), error = %e);
            }
        }
    }
}

//! Append-only audit trail.
//!
//! Every gating decision ends in exactly one audit event. Sinks are
//! fire-and-forget: [`AuditSink::log`] returns nothing, and a sink that cannot
//! write reports through `tracing` instead of failing the call.
//!
//! [`JsonlAuditSink::open`] hands lines to a background writer thread, so
//! the async call path never waits on disk. The writer is lossless: when its
//! queue is full, `log` waits rather than dropping an event.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};

/// Audit event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A call passed every check and the operation ran.
    CallExecuted,
    /// A call was refused at a gating check.
    CallDenied,
    /// The operation ran but its post-execution consume found no budget.
    BudgetRaceLost,
    /// A lease was issued through the dispatcher or the admin CLI.
    LeaseGranted,
    /// A lease was revoked.
    LeaseRevoked,
    /// A schema request was answered or refused.
    SchemaRequested,
    /// The governance mode was changed.
    ModeChanged,
    /// A scoped elevation was granted after approval.
    ElevationGranted,
    /// Elevations were revoked.
    ElevationsRevoked,
}

impl AuditEventType {
    /// The snake_case tag as written to the trail.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallExecuted => "call_executed",
            Self::CallDenied => "call_denied",
            Self::BudgetRaceLost => "budget_race_lost",
            Self::LeaseGranted => "lease_granted",
            Self::LeaseRevoked => "lease_revoked",
            Self::SchemaRequested => "schema_requested",
            Self::ModeChanged => "mode_changed",
            Self::ElevationGranted => "elevation_granted",
            Self::ElevationsRevoked => "elevations_revoked",
        }
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    /// Record an event. Must not block on durability and must not panic.
    fn log(&self, event_type: AuditEventType, fields: serde_json::Value);
}

#[derive(Serialize)]
struct AuditLine<'a> {
    timestamp: String,
    event_type: AuditEventType,
    fields: &'a serde_json::Value,
}

/// Writes one JSON object per line to an append-only writer.
///
/// Dropping the sink flushes whatever the background writer still holds.
pub struct JsonlAuditSink {
    writer: Mutex<Box<dyn Write + Send>>,
    _worker: Option<WorkerGuard>,
}

impl std::fmt::Debug for JsonlAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlAuditSink").finish_non_exhaustive()
    }
}

impl JsonlAuditSink {
    /// Append to the file at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (writer, worker) = NonBlockingBuilder::default()
            .lossy(false)
            .thread_name("leasegate-audit")
            .finish(file);
        Ok(Self {
            writer: Mutex::new(Box::new(writer)),
            _worker: Some(worker),
        })
    }

    /// Wrap an arbitrary writer, written to synchronously.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            _worker: None,
        }
    }

    fn write_line(
        &self,
        event_type: AuditEventType,
        fields: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let line = serde_json::to_string(&AuditLine {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            fields,
        })?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl AuditSink for JsonlAuditSink {
    fn log(&self, event_type: AuditEventType, fields: serde_json::Value) {
        if let Err(e) = self.write_line(event_type, &fields) {
            warn!(event_type = event_type.as_str(), error = %e, "audit write failed");
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn log(&self, _event_type: AuditEventType, _fields: serde_json::Value) {}
}

/// Keeps events in memory; for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<(AuditEventType, serde_json::Value)>>,
}

impl MemoryAuditSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    pub fn events(&self) -> Vec<(AuditEventType, serde_json::Value)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events of one type.
    pub fn of_type(&self, event_type: AuditEventType) -> Vec<serde_json::Value> {
        self.events()
            .into_iter()
            .filter(|(t, _)| *t == event_type)
            .map(|(_, fields)| fields)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log(&self, event_type: AuditEventType, fields: serde_json::Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event_type, fields));
        }
    }
}

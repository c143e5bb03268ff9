//! Audit logging: every distribution decision emits a structured event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use cryptoshovel_envelope::{Fingerprint, KeyId};

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuditAction {
    MembershipLoaded { receivers: usize, active: usize },
    MembershipRejected { reason: String },
    IntervalChanged { from_ms: i64, to_ms: i64 },
    KeyMinted,
    KeySent,
    KeySendFailed { reason: String },
    KeyActivated,
    RolloutAbandoned,
    RolloutJoined { receivers: usize },
    KeyReceived,
    KeyIgnored,
    MessageDecryptFailed { reason: String },
}

/// A structured audit event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Which symmetric key was involved (base64 id).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_id: Option<String>,
    /// Which receiver was involved (hex fingerprint).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub receiver: Option<String>,
    /// What happened.
    pub action: AuditAction,
    /// Success or failure.
    pub success: bool,
    /// Additional context.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(timestamp: DateTime<Utc>, action: AuditAction) -> Self {
        Self {
            timestamp,
            key_id: None,
            receiver: None,
            action,
            success: true,
            detail: None,
        }
    }

    pub fn with_key(mut self, key_id: Option<KeyId>) -> Self {
        self.key_id = key_id.map(|id| id.to_base64());
        self
    }

    pub fn with_receiver(mut self, receiver: &Fingerprint) -> Self {
        self.receiver = Some(receiver.to_hex());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.success = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Audit sink trait
// ---------------------------------------------------------------------------

/// Where audit events go.
///
/// Synchronous: the distributor records from inside its state machine.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

// ---------------------------------------------------------------------------
// Built-in sinks
// ---------------------------------------------------------------------------

/// Logs events via the `tracing` crate.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        if event.success {
            tracing::info!(
                timestamp = %event.timestamp,
                key_id = ?event.key_id,
                receiver = ?event.receiver,
                action = ?event.action,
                detail = ?event.detail,
                "audit"
            );
        } else {
            tracing::warn!(
                timestamp = %event.timestamp,
                key_id = ?event.key_id,
                receiver = ?event.receiver,
                action = ?event.action,
                detail = ?event.detail,
                "audit"
            );
        }
    }
}

/// Collects events in memory (for tests).
#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, matches: impl Fn(&AuditAction) -> bool) -> usize {
        self.events().iter().filter(|e| matches(&e.action)).count()
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Writes JSON events to a file (append-only, one event per line).
///
/// Lines are appended by a dedicated thread so `record` never touches the
/// disk. Dropping the sink waits for queued lines to be written.
pub struct FileAuditSink {
    path: PathBuf,
    lines: Option<std_mpsc::Sender<String>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = std_mpsc::channel::<String>();
        let target = path.clone();
        let spawned = thread::Builder::new()
            .name("audit-log".into())
            .spawn(move || {
                for line in rx {
                    append_line(&target, &line);
                }
            });
        match spawned {
            Ok(writer) => Self {
                path,
                lines: Some(tx),
                writer: Some(writer),
            },
            Err(e) => {
                tracing::warn!(error = %e, "no audit writer thread, writing inline");
                Self {
                    path,
                    lines: None,
                    writer: None,
                }
            }
        }
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("audit serialize error: {}", e);
                return;
            }
        };
        let unsent = match &self.lines {
            Some(lines) => lines.send(line).err().map(|e| e.0),
            None => Some(line),
        };
        if let Some(line) = unsent {
            append_line(&self.path, &line);
        }
    }
}

impl Drop for FileAuditSink {
    fn drop(&mut self) {
        self.lines.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::warn!(path = %self.path.display(), "audit writer thread panicked");
            }
        }
    }
}

fn append_line(path: &Path, line: &str) {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(mut file) => {
            if let Err(e) = writeln!(file, "{}", line) {
                tracing::warn!(path = %path.display(), "audit write error: {}", e);
            }
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "cannot open audit log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_events(path: &Path) -> Vec<AuditEvent> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink = FileAuditSink::new(&path);
        let now = Utc::now();

        sink.record(
            AuditEvent::new(now, AuditAction::KeyMinted).with_key(Some(KeyId::from_bytes([1; 8]))),
        );
        sink.record(
            AuditEvent::new(now, AuditAction::KeySendFailed { reason: "down".into() }).with_failure(),
        );
        drop(sink);

        let events = read_events(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key_id.as_deref(), Some("AQEBAQEBAQE="));
        assert!(!events[1].success);
    }

    #[test]
    fn file_sink_writes_from_its_own_thread_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink = FileAuditSink::new(&path);
        assert!(sink.writer.is_some());
        let now = Utc::now();

        for n in 0..50 {
            sink.record(AuditEvent::new(now, AuditAction::KeySent).with_detail(n.to_string()));
        }
        drop(sink);

        let details: Vec<String> = read_events(&path)
            .into_iter()
            .map(|e| e.detail.unwrap())
            .collect();
        let expected: Vec<String> = (0..50).map(|n: i32| n.to_string()).collect();
        assert_eq!(details, expected);
    }

    #[test]
    fn file_sink_reports_unwritable_log_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("audit.log");
        let sink = FileAuditSink::new(&path);
        sink.record(AuditEvent::new(Utc::now(), AuditAction::KeyMinted));
        drop(sink);
        assert!(!path.exists());
    }

    #[test]
    fn memory_sink_counts_by_action() {
        let sink = InMemoryAuditSink::new();
        let now = Utc::now();
        sink.record(AuditEvent::new(now, AuditAction::KeySent));
        sink.record(AuditEvent::new(now, AuditAction::KeySent));
        sink.record(AuditEvent::new(now, AuditAction::KeyActivated));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.count(|a| matches!(a, AuditAction::KeySent)), 2);
    }
}

//! Append-only audit trail.
//!
//! Every registry and the dispatcher call [`AuditLog::append`] right after a
//! mutation commits. The call cannot fail from the caller's point of view: a
//! sink error is logged, counted in [`Metrics`], and swallowed, so the business
//! mutation is never rolled back because the audit write did not land.
//!
//! Sinks:
//! - [`MemoryAuditSink`]: process-local, the default
//! - [`JsonlAuditSink`]: one JSON object per line, opened in append mode

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::models::{Actor, AuditEvent, Severity};

/// Number of entries a file sink keeps in memory for read-back
const JSONL_TAIL_CAPACITY: usize = 1000;

/// Audit sink failures. Never surfaced to API callers.
#[derive(Error, Debug)]
pub enum AuditError {
    /// File I/O failed
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be encoded
    #[error("audit encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sink-specific failure
    #[error("audit sink error: {0}")]
    Sink(String),
}

/// Destination for audit entries
pub trait AuditSink: Send + Sync + 'static {
    /// Persist one entry
    fn write(&self, event: &AuditEvent) -> Result<(), AuditError>;

    /// Most recent entries, newest first
    fn recent(&self, limit: usize) -> Vec<AuditEvent>;
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry, oldest first
    pub fn entries(&self) -> Vec<AuditEvent> {
        self.entries.read().clone()
    }

    /// Number of entries written
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.entries.write().push(event.clone());
        Ok(())
    }

    fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        self.entries.read().iter().rev().take(limit).cloned().collect()
    }
}

/// JSON-lines file sink
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
    tail: Mutex<VecDeque<AuditEvent>>,
}

impl JsonlAuditSink {
    /// Open (or create) `path` in append mode and load its tail for read-back
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut tail = VecDeque::with_capacity(JSONL_TAIL_CAPACITY);
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEvent>(&line) {
                    Ok(event) => {
                        if tail.len() == JSONL_TAIL_CAPACITY {
                            tail.pop_front();
                        }
                        tail.push_back(event);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable audit line");
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            tail: Mutex::new(tail),
        })
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn write(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        {
            let mut file = self.file.lock();
            file.write_all(&line)?;
            file.flush()?;
        }

        let mut tail = self.tail.lock();
        if tail.len() == JSONL_TAIL_CAPACITY {
            tail.pop_front();
        }
        tail.push_back(event.clone());
        Ok(())
    }

    fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        self.tail.lock().iter().rev().take(limit).cloned().collect()
    }
}

/// Description of a mutation, completed into an [`AuditEvent`] on append
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// Dotted action name
    pub action: &'static str,
    /// Affected collection
    pub collection: &'static str,
    /// Affected record id
    pub record_id: String,
    /// Human summary
    pub summary: String,
    /// Severity
    pub severity: Severity,
}

impl AuditRecord {
    /// Info-level record
    pub fn info(
        action: &'static str,
        collection: &'static str,
        record_id: impl ToString,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            action,
            collection,
            record_id: record_id.to_string(),
            summary: summary.into(),
            severity: Severity::Info,
        }
    }

    /// Same record with a different severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// The audit facade shared by every component
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl AuditLog {
    /// Wrap a sink
    pub fn new(sink: Arc<dyn AuditSink>, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self {
            sink,
            clock,
            metrics,
        }
    }

    /// Append one entry. Sink failures are reported out-of-band only.
    pub fn append(&self, actor: &Actor, record: AuditRecord) -> AuditEvent {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            action: record.action.to_string(),
            collection: record.collection.to_string(),
            record_id: record.record_id,
            summary: record.summary,
            actor_role: actor.role,
            actor_id: actor.id.clone(),
            severity: record.severity,
            created_at: self.clock.now(),
        };

        if let Err(e) = self.sink.write(&event) {
            self.metrics.record_audit_failure();
            tracing::error!(
                audit_id = %event.id,
                action = %event.action,
                record_id = %event.record_id,
                error = %e,
                "failed to write audit entry"
            );
        }

        event
    }

    /// Most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        self.sink.recent(limit)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

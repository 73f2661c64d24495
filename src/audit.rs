//! Audit hooks for authentication outcomes and gate denials. Sinks must not fail the decision.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub user: Option<String>,
    pub operation: String,
    pub resource: String,
    pub allowed: bool,
}

impl AuditEvent {
    pub fn new(user: Option<&str>, operation: &str, resource: &str, allowed: bool) -> Self {
        Self { timestamp: Utc::now(), user: user.map(String::from), operation: operation.to_string(), resource: resource.to_string(), allowed }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Appends one JSON object per line.
pub struct JsonLineAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLineAuditSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self { Self { path: path.as_ref().to_path_buf(), write_lock: Mutex::new(()) } }
    pub fn path(&self) -> &Path { &self.path }

    fn append(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let _g = self.write_lock.lock();
        let mut f = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }
}

impl AuditSink for JsonLineAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Err(e) = self.append(event) {
            tracing::warn!(target: "rowsec::auth", path = %self.path.display(), error = %e, "audit sink write failed");
        }
    }
}

/// Per-service sink list.
#[derive(Default)]
pub struct AuditHooks {
    sinks: RwLock<Vec<Arc<dyn AuditSink>>>,
}

impl AuditHooks {
    pub fn register(&self, sink: Arc<dyn AuditSink>) { self.sinks.write().push(sink); }
    pub fn is_empty(&self) -> bool { self.sinks.read().is_empty() }

    pub fn emit(&self, event: AuditEvent) {
        for s in self.sinks.read().iter() {
            s.record(&event);
        }
    }
}

//! Study-scoped audit log.

use std::sync::Mutex;

use serde::Serialize;

use crate::identity::{ComponentRunId, RunId, StudyId, WorkerId};

/// One line of the per-study log.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AuditEntry {
    pub study_id: StudyId,
    pub run_id: Option<RunId>,
    pub worker_id: Option<WorkerId>,
    pub component_run_id: Option<ComponentRunId>,
    pub message: String,
}

impl AuditEntry {
    pub fn new(study_id: StudyId, message: impl Into<String>) -> Self {
        Self {
            study_id,
            run_id: None,
            worker_id: None,
            component_run_id: None,
            message: message.into(),
        }
    }

    pub fn with_run(mut self, run_id: RunId, worker_id: WorkerId) -> Self {
        self.run_id = Some(run_id);
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_component_run(mut self, component_run_id: ComponentRunId) -> Self {
        self.component_run_id = Some(component_run_id);
        self
    }
}

pub trait AuditLog: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Emits entries as structured events on the `publix::audit` target.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "publix::audit",
            study_id = entry.study_id,
            run_id = ?entry.run_id,
            worker_id = ?entry.worker_id,
            component_run_id = ?entry.component_run_id,
            "{}",
            entry.message
        );
    }
}

/// Keeps entries in memory; used by tests.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl AuditLog for MemoryAuditLog {
    fn record(&self, entry: AuditEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use troupe_core::types::{TaskStatus, WorkflowEvent, WorkflowStats};

/// One immutable record in the workflow log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: WorkflowEvent,
    /// Present on workflow status transitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<WorkflowStats>,
}

/// Append-only audit trail of a workflow run.
///
/// Entries are never changed or removed. Readers get a snapshot, which is
/// always a consistent prefix of the log.
#[derive(Debug, Default)]
pub struct WorkflowLog {
    entries: RwLock<Vec<LogEntry>>,
}

impl WorkflowLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and return its sequence number.
    pub fn append(&self, event: WorkflowEvent, stats: Option<WorkflowStats>) -> u64 {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let seq = entries.len() as u64;
        entries.push(LogEntry {
            seq,
            timestamp: Utc::now(),
            event,
            stats,
        });
        seq
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Result carried by the latest status change of `task_id` that has one.
    pub fn latest_result(&self, task_id: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().rev().find_map(|entry| match &entry.event {
            WorkflowEvent::TaskStatusChanged {
                task_id: id,
                result: Some(result),
                ..
            } if id == task_id => Some(result.clone()),
            _ => None,
        })
    }

    /// How many times `task_id` entered `status`.
    pub fn transitions_to(&self, task_id: &str, status: TaskStatus) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|entry| {
                matches!(
                    &entry.event,
                    WorkflowEvent::TaskStatusChanged { task_id: id, to, .. }
                        if id == task_id && *to == status
                )
            })
            .count()
    }

    /// One JSON object per line.
    pub fn to_jsonl(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for entry in self.snapshot() {
            out.push_str(&serde_json::to_string(&entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

//! Project-history ledger — per-project aggregation of terminated tasks.
//!
//! Single-writer per project: entries are recorded only on terminal
//! transitions, by the coordinator that owns the task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{GateReason, Task, TaskStatus};

/// One ledger entry, written when a task terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectHistoryEntry {
    pub project: String,
    pub task_id: String,
    pub title: String,
    pub terminal_status: TaskStatus,
    pub gate_reason: Option<GateReason>,
    pub rounds_completed: u32,
    /// Condensed findings carried forward into future task seeds.
    pub core_findings: Vec<String>,
    /// Revision requests the author acted on.
    pub revisions: Vec<String>,
    /// Reviewer disagreements left unresolved at termination.
    pub disputes: Vec<String>,
    pub next_steps: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ProjectHistoryEntry {
    /// Build a ledger entry from a terminated task.
    pub fn from_task(
        task: &Task,
        core_findings: Vec<String>,
        revisions: Vec<String>,
        disputes: Vec<String>,
        next_steps: Vec<String>,
    ) -> Self {
        Self {
            project: task.project_slug(),
            task_id: task.id.clone(),
            title: task.title.clone(),
            terminal_status: task.status,
            gate_reason: task.last_gate_reason,
            rounds_completed: task.rounds_completed,
            core_findings,
            revisions,
            disputes,
            next_steps,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_task_captures_terminal_state() {
        let mut task = crate::task::types::tests::test_task();
        task.status = TaskStatus::FailedGate;
        task.last_gate_reason = Some(GateReason::LoopNoProgress);
        task.rounds_completed = 4;

        let entry = ProjectHistoryEntry::from_task(
            &task,
            vec!["flaky test in ci".to_string()],
            vec![],
            vec![],
            vec!["narrow scope".to_string()],
        );
        assert_eq!(entry.project, "ws");
        assert_eq!(entry.terminal_status, TaskStatus::FailedGate);
        assert_eq!(entry.gate_reason, Some(GateReason::LoopNoProgress));
        assert_eq!(entry.rounds_completed, 4);
    }
}

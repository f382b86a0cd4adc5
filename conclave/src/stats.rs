//! Aggregates for the stats and analytics endpoints, computed over task
//! records and event logs. The event stream is the source of truth; these
//! are derived views.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::task::{EventKind, GateReason, Task, TaskEvent, TaskStatus};

/// Snapshot served by `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_tasks: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub reason_buckets: BTreeMap<String, usize>,
    pub provider_error_counts: BTreeMap<String, usize>,
    pub recent: RecentWindow,
}

/// Terminations inside the trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct RecentWindow {
    pub window_hours: i64,
    pub terminated: usize,
    pub passed: usize,
    pub pass_rate: f64,
}

/// Compute the stats snapshot.
pub fn compute_stats(tasks: &[Task], events: &[TaskEvent], window: Duration) -> StatsSnapshot {
    let mut status_counts = BTreeMap::new();
    let mut reason_buckets = BTreeMap::new();
    for task in tasks {
        *status_counts.entry(task.status.to_string()).or_insert(0) += 1;
        if let Some(reason) = task.last_gate_reason {
            *reason_buckets.entry(reason.to_string()).or_insert(0) += 1;
        }
    }

    let mut provider_error_counts = BTreeMap::new();
    for event in events {
        let is_provider_error = matches!(
            event.kind,
            EventKind::ReviewError
                | EventKind::ProposalPrecheckUnavailable
                | EventKind::ProposalReviewUnavailable
        );
        if is_provider_error {
            let provider = event
                .participant_id
                .as_ref()
                .map(|p| p.provider.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            *provider_error_counts.entry(provider).or_insert(0) += 1;
        }
    }

    let cutoff = Utc::now() - window;
    let recent_terminated: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.terminated_at.map(|at| at >= cutoff).unwrap_or(false))
        .collect();
    let recent_passed = recent_terminated
        .iter()
        .filter(|t| t.status == TaskStatus::Passed)
        .count();
    let pass_rate = if recent_terminated.is_empty() {
        0.0
    } else {
        recent_passed as f64 / recent_terminated.len() as f64
    };

    StatsSnapshot {
        total_tasks: tasks.len(),
        status_counts,
        reason_buckets,
        provider_error_counts,
        recent: RecentWindow {
            window_hours: window.num_hours(),
            terminated: recent_terminated.len(),
            passed: recent_passed,
            pass_rate,
        },
    }
}

/// Failure taxonomy bucket for a gate reason, mirroring the error-handling
/// design: gate, system, policy, operator, admission.
pub fn taxonomy_bucket(reason: GateReason) -> &'static str {
    use GateReason::*;
    match reason {
        ReviewBlocker | ReviewIssueChecksMissing | ReviewIssueUnresolved | VerificationFailed
        | PrecompletionEvidenceMissing | PrecompletionCommandsMissing | CommandTimeout => "gate",
        CommandNotFound | ProviderLimit | SandboxAllocationFailed | HeadShaMismatch
        | BranchNotAllowed | WorktreeDirty => "system",
        DeadlineReached | LoopNoProgress | ProposalConsensusStalledInRound
        | ProposalConsensusStalledAcrossRounds | ProposalPrecheckUnavailable
        | ProposalReviewUnavailable | WorkspaceResumeGuardMismatch | PreflightRiskGateFailed
        | WatchdogTimeout => "policy",
        AuthorApproved | AuthorRejected | AuthorFeedbackRequested
        | AuthorConfirmationRequired | ForceFailed => "operator",
        ConcurrencyLimit | StartDeduped => "admission",
        AutoMergeCompleted => "gate",
    }
}

/// Analytics served by `/api/analytics`: failure taxonomy plus per-reviewer
/// drift (change in blocker rate between the older and newer halves of a
/// reviewer's verdicts).
#[derive(Debug, Clone, Serialize)]
pub struct Analytics {
    pub failure_taxonomy: BTreeMap<String, usize>,
    pub reviewer_drift: Vec<ReviewerDrift>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewerDrift {
    pub reviewer: String,
    pub verdicts: usize,
    pub early_blocker_rate: f64,
    pub late_blocker_rate: f64,
    pub drift: f64,
}

pub fn compute_analytics(tasks: &[Task], events: &[TaskEvent]) -> Analytics {
    let mut failure_taxonomy = BTreeMap::new();
    for task in tasks.iter().filter(|t| t.status.is_terminal()) {
        if let Some(reason) = task.last_gate_reason {
            *failure_taxonomy
                .entry(taxonomy_bucket(reason).to_string())
                .or_insert(0) += 1;
        }
    }

    // Chronological verdict stream per reviewer.
    let mut per_reviewer: BTreeMap<String, Vec<bool>> = BTreeMap::new();
    for event in events {
        if !matches!(event.kind, EventKind::ProposalReview | EventKind::ProposalPrecheckReview) {
            continue;
        }
        let Some(participant) = &event.participant_id else {
            continue;
        };
        let Some(verdict) = event.payload.get("verdict").and_then(|v| v.as_str()) else {
            continue;
        };
        per_reviewer
            .entry(participant.to_string())
            .or_default()
            .push(verdict != "no_blocker");
    }

    let reviewer_drift = per_reviewer
        .into_iter()
        .filter(|(_, verdicts)| verdicts.len() >= 2)
        .map(|(reviewer, verdicts)| {
            let mid = verdicts.len() / 2;
            let rate = |slice: &[bool]| {
                if slice.is_empty() {
                    0.0
                } else {
                    slice.iter().filter(|b| **b).count() as f64 / slice.len() as f64
                }
            };
            let early = rate(&verdicts[..mid]);
            let late = rate(&verdicts[mid..]);
            ReviewerDrift {
                reviewer,
                verdicts: verdicts.len(),
                early_blocker_rate: early,
                late_blocker_rate: late,
                drift: late - early,
            }
        })
        .collect();

    Analytics {
        failure_taxonomy,
        reviewer_drift,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ParticipantId;
    use serde_json::json;

    fn terminated_task(status: TaskStatus, reason: GateReason) -> Task {
        let mut task = crate::task::types::tests::test_task();
        task.status = status;
        task.last_gate_reason = Some(reason);
        task.terminated_at = Some(Utc::now());
        task
    }

    #[test]
    fn test_stats_counts_and_pass_rate() {
        let tasks = vec![
            terminated_task(TaskStatus::Passed, GateReason::AutoMergeCompleted),
            terminated_task(TaskStatus::FailedGate, GateReason::ReviewBlocker),
            terminated_task(TaskStatus::FailedGate, GateReason::ReviewBlocker),
        ];
        let stats = compute_stats(&tasks, &[], Duration::hours(24));
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.status_counts["failed_gate"], 2);
        assert_eq!(stats.reason_buckets["review_blocker"], 2);
        assert_eq!(stats.recent.terminated, 3);
        assert!((stats.recent.pass_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_provider_error_counts() {
        let reviewer = ParticipantId::parse("gemini#rev").unwrap();
        let event = TaskEvent::new("t-1", EventKind::ReviewError).with_participant(reviewer);
        let stats = compute_stats(&[], &[event], Duration::hours(24));
        assert_eq!(stats.provider_error_counts["gemini"], 1);
    }

    #[test]
    fn test_taxonomy_buckets_are_disjoint_and_total() {
        // Spot-check a representative from each bucket.
        assert_eq!(taxonomy_bucket(GateReason::ReviewBlocker), "gate");
        assert_eq!(taxonomy_bucket(GateReason::CommandNotFound), "system");
        assert_eq!(taxonomy_bucket(GateReason::DeadlineReached), "policy");
        assert_eq!(taxonomy_bucket(GateReason::ForceFailed), "operator");
        assert_eq!(taxonomy_bucket(GateReason::StartDeduped), "admission");
    }

    #[test]
    fn test_reviewer_drift() {
        let reviewer = ParticipantId::parse("codex#rev").unwrap();
        let mut events = Vec::new();
        for verdict in ["no_blocker", "no_blocker", "blocker", "blocker"] {
            events.push(
                TaskEvent::new("t-1", EventKind::ProposalReview)
                    .with_participant(reviewer.clone())
                    .with_payload(json!({"verdict": verdict})),
            );
        }
        let analytics = compute_analytics(&[], &events);
        assert_eq!(analytics.reviewer_drift.len(), 1);
        let drift = &analytics.reviewer_drift[0];
        assert_eq!(drift.verdicts, 4);
        assert!((drift.early_blocker_rate - 0.0).abs() < 1e-9);
        assert!((drift.late_blocker_rate - 1.0).abs() < 1e-9);
        assert!((drift.drift - 1.0).abs() < 1e-9);
    }
}

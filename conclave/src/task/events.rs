//! Append-only task events.
//!
//! Events are the source of truth for observers: the full task state can be
//! reconstructed from the per-task sequence alone. Sequence numbers are
//! allocated by the repository under a uniqueness constraint and are
//! contiguous per task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::ParticipantId;

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Lifecycle
    Created,
    Started,
    StartDeferred,
    StartDeduped,
    QueuedForManual,
    AuthorDecision,
    AuthorConfirmationRequired,
    Canceled,
    ForceFailed,
    Terminated,

    // Phases
    DiscussionStarted,
    ImplementationStarted,
    ReviewStarted,
    VerificationStarted,
    GateDecision,

    // Proposal consensus
    ProposalPrecheckReview,
    ProposalReview,
    ProposalConsensusReached,
    ProposalConsensusRetry,
    ProposalConsensusStalled,
    ProposalReviewPartial,
    ProposalPrecheckUnavailable,
    ProposalReviewUnavailable,

    // Guards
    PrecompletionChecklist,
    WorkspaceResumeGuard,
    PreflightRiskGate,
    PromotionGuardChecked,
    HeadShaMismatch,

    // Progress
    StrategyShifted,
    ReviewError,
    AutoMergeCompleted,
    RoundPromoted,

    // Streaming
    ParticipantStream,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::StartDeferred => "start_deferred",
            Self::StartDeduped => "start_deduped",
            Self::QueuedForManual => "queued_for_manual",
            Self::AuthorDecision => "author_decision",
            Self::AuthorConfirmationRequired => "author_confirmation_required",
            Self::Canceled => "canceled",
            Self::ForceFailed => "force_failed",
            Self::Terminated => "terminated",
            Self::DiscussionStarted => "discussion_started",
            Self::ImplementationStarted => "implementation_started",
            Self::ReviewStarted => "review_started",
            Self::VerificationStarted => "verification_started",
            Self::GateDecision => "gate_decision",
            Self::ProposalPrecheckReview => "proposal_precheck_review",
            Self::ProposalReview => "proposal_review",
            Self::ProposalConsensusReached => "proposal_consensus_reached",
            Self::ProposalConsensusRetry => "proposal_consensus_retry",
            Self::ProposalConsensusStalled => "proposal_consensus_stalled",
            Self::ProposalReviewPartial => "proposal_review_partial",
            Self::ProposalPrecheckUnavailable => "proposal_precheck_unavailable",
            Self::ProposalReviewUnavailable => "proposal_review_unavailable",
            Self::PrecompletionChecklist => "precompletion_checklist",
            Self::WorkspaceResumeGuard => "workspace_resume_guard",
            Self::PreflightRiskGate => "preflight_risk_gate",
            Self::PromotionGuardChecked => "promotion_guard_checked",
            Self::HeadShaMismatch => "head_sha_mismatch",
            Self::StrategyShifted => "strategy_shifted",
            Self::ReviewError => "review_error",
            Self::AutoMergeCompleted => "auto_merge_completed",
            Self::RoundPromoted => "round_promoted",
            Self::ParticipantStream => "participant_stream",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable entry in a task's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    /// Strictly increasing, contiguous per task. Zero means "not yet
    /// allocated" — the repository assigns the real value on append.
    #[serde(default)]
    pub seq: u64,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<ParticipantId>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    /// New unsequenced event with an empty payload.
    pub fn new(task_id: &str, kind: EventKind) -> Self {
        Self {
            task_id: task_id.to_string(),
            seq: 0,
            kind,
            participant_id: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Attach a structured payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attach the participant this event concerns.
    pub fn with_participant(mut self, participant: ParticipantId) -> Self {
        self.participant_id = Some(participant);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_snake_case() {
        assert_eq!(EventKind::GateDecision.to_string(), "gate_decision");
        assert_eq!(
            EventKind::ProposalConsensusStalled.to_string(),
            "proposal_consensus_stalled"
        );
        assert_eq!(
            EventKind::WorkspaceResumeGuard.to_string(),
            "workspace_resume_guard"
        );
    }

    #[test]
    fn test_event_json_round_trip() {
        let event = TaskEvent::new("t-1", EventKind::GateDecision)
            .with_payload(json!({"round": 2, "passed": false, "reason": "review_blocker"}))
            .with_participant(ParticipantId::parse("gemini#rev").unwrap());

        let line = serde_json::to_string(&event).unwrap();
        let parsed: TaskEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.kind, EventKind::GateDecision);
        assert_eq!(parsed.payload["round"], 2);
        assert_eq!(
            parsed.participant_id.unwrap().to_string(),
            "gemini#rev"
        );
    }

    #[test]
    fn test_participant_omitted_when_absent() {
        let event = TaskEvent::new("t-1", EventKind::Created);
        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains("participant_id"));
    }
}

//! Core task types — participants, strategy options, status graph, gate reasons.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider behind a participant. Extensions keep the grammar open for
/// operator-registered adapters without widening the closed set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
    Extension(String),
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Codex => write!(f, "codex"),
            Self::Gemini => write!(f, "gemini"),
            Self::Extension(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for Provider {
    type Err = ParticipantIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(ParticipantIdError::EmptyProvider),
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            other => Ok(Self::Extension(other.to_string())),
        }
    }
}

/// Error parsing a `provider#alias` participant id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParticipantIdError {
    #[error("participant id must be provider#alias, got {0:?}")]
    MissingSeparator(String),
    #[error("participant provider must be non-empty")]
    EmptyProvider,
    #[error("participant alias must be non-empty")]
    EmptyAlias,
}

/// A participant identity: `provider#alias`. Unique within a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId {
    pub provider: Provider,
    pub alias: String,
}

impl ParticipantId {
    /// Parse a `provider#alias` string.
    pub fn parse(raw: &str) -> Result<Self, ParticipantIdError> {
        let (provider, alias) = raw
            .split_once('#')
            .ok_or_else(|| ParticipantIdError::MissingSeparator(raw.to_string()))?;
        if alias.is_empty() {
            return Err(ParticipantIdError::EmptyAlias);
        }
        Ok(Self {
            provider: provider.parse()?,
            alias: alias.to_string(),
        })
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.provider, self.alias)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = ParticipantIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.to_string()
    }
}

/// How aggressively the author may restructure code while repairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepairMode {
    Minimal,
    #[default]
    Balanced,
    Structural,
}

impl std::fmt::Display for RepairMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minimal => write!(f, "minimal"),
            Self::Balanced => write!(f, "balanced"),
            Self::Structural => write!(f, "structural"),
        }
    }
}

/// Conversation language passed through to participant prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationLanguage {
    #[default]
    En,
    Zh,
}

/// Cross-round participant memory policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    #[default]
    Off,
    Basic,
    Strict,
}

/// Per-phase wall-clock limits, in seconds. Unset phases use the
/// gateway default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhaseTimeouts {
    pub discussion_secs: Option<u64>,
    pub implementation_secs: Option<u64>,
    pub review_secs: Option<u64>,
    pub verification_secs: Option<u64>,
}

/// Model and argument override applied to a provider or a single
/// participant. Participant-level overrides take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ParticipantOverride {
    pub model: Option<String>,
    /// Passed to the adapter verbatim, appended after built-in arguments.
    pub extra_args: Option<String>,
}

/// Write-back policy checked by the promotion guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PromotionPolicy {
    /// Empty list means any branch is acceptable.
    pub allowed_branches: Vec<String>,
    pub require_clean_worktree: bool,
}

/// Strategy options. Immutable after create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub sandbox_mode: bool,
    pub self_loop_mode: bool,
    pub auto_merge: bool,
    pub debate_mode: bool,
    pub plain_mode: bool,
    pub stream_mode: bool,
    /// 0..=3, escalating self-evolution ambition.
    pub evolution_level: u8,
    pub repair_mode: RepairMode,
    /// 1..=20 rounds when no deadline is configured.
    pub max_rounds: u32,
    /// Wall-clock deadline; takes precedence over `max_rounds` when set.
    pub evolve_until: Option<DateTime<Utc>>,
    pub conversation_language: ConversationLanguage,
    pub memory_mode: MemoryMode,
    pub phase_timeouts: PhaseTimeouts,
    pub provider_overrides: HashMap<String, ParticipantOverride>,
    pub participant_overrides: HashMap<String, ParticipantOverride>,
    pub claude_team_agents: Option<bool>,
    pub codex_multi_agents: Option<bool>,
    /// Provider substituted for the author while its own provider sits in
    /// a rate-limit cooldown window.
    pub fallback_provider: Option<Provider>,
    pub test_command: Option<String>,
    pub lint_command: Option<String>,
    pub command_timeout_secs: u64,
    pub promotion: PromotionPolicy,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            sandbox_mode: true,
            self_loop_mode: false,
            auto_merge: false,
            debate_mode: true,
            plain_mode: false,
            stream_mode: false,
            evolution_level: 1,
            repair_mode: RepairMode::default(),
            max_rounds: 3,
            evolve_until: None,
            conversation_language: ConversationLanguage::default(),
            memory_mode: MemoryMode::default(),
            phase_timeouts: PhaseTimeouts::default(),
            provider_overrides: HashMap::new(),
            participant_overrides: HashMap::new(),
            claude_team_agents: None,
            codex_multi_agents: None,
            fallback_provider: None,
            test_command: None,
            lint_command: None,
            command_timeout_secs: 300,
            promotion: PromotionPolicy::default(),
        }
    }
}

impl TaskOptions {
    /// Validate option cardinalities at create time.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=20).contains(&self.max_rounds) {
            return Err(format!("max_rounds must be in 1..=20, got {}", self.max_rounds));
        }
        if self.evolution_level > 3 {
            return Err(format!(
                "evolution_level must be in 0..=3, got {}",
                self.evolution_level
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err("command_timeout_secs must be positive".to_string());
        }
        Ok(())
    }

    /// Effective override for a participant: participant-level wins, falling
    /// back to the provider-level entry field by field. Multi-agent flags
    /// become adapter arguments for the provider they concern.
    pub fn override_for(&self, id: &ParticipantId) -> ParticipantOverride {
        let provider = self.provider_overrides.get(&id.provider.to_string());
        let participant = self.participant_overrides.get(&id.to_string());
        let mut extra_args = participant
            .and_then(|o| o.extra_args.clone())
            .or_else(|| provider.and_then(|o| o.extra_args.clone()));

        let multi_agent_flag = match id.provider {
            Provider::Claude if self.claude_team_agents == Some(true) => Some("--team-agents"),
            Provider::Codex if self.codex_multi_agents == Some(true) => Some("--multi-agent"),
            _ => None,
        };
        if let Some(flag) = multi_agent_flag {
            extra_args = Some(match extra_args {
                Some(args) => format!("{} {}", args, flag),
                None => flag.to_string(),
            });
        }

        ParticipantOverride {
            model: participant
                .and_then(|o| o.model.clone())
                .or_else(|| provider.and_then(|o| o.model.clone())),
            extra_args,
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    WaitingManual,
    Passed,
    FailedGate,
    FailedSystem,
    Canceled,
}

impl TaskStatus {
    /// Whether this is a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Passed | Self::FailedGate | Self::FailedSystem | Self::Canceled
        )
    }

    /// Valid successor statuses. Everything else is rejected by the
    /// repository's compare-and-set.
    pub fn valid_transitions(self) -> &'static [TaskStatus] {
        match self {
            Self::Queued => &[Self::Running, Self::Canceled],
            Self::Running => &[
                Self::WaitingManual,
                Self::Passed,
                Self::FailedGate,
                Self::FailedSystem,
                Self::Canceled,
            ],
            Self::WaitingManual => &[Self::Queued, Self::Canceled, Self::FailedSystem],
            Self::Passed | Self::FailedGate | Self::FailedSystem | Self::Canceled => &[],
        }
    }

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::WaitingManual => write!(f, "waiting_manual"),
            Self::Passed => write!(f, "passed"),
            Self::FailedGate => write!(f, "failed_gate"),
            Self::FailedSystem => write!(f, "failed_system"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Closed vocabulary describing why a task reached its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    ProposalConsensusStalledInRound,
    ProposalConsensusStalledAcrossRounds,
    ProposalPrecheckUnavailable,
    ProposalReviewUnavailable,
    PrecompletionEvidenceMissing,
    PrecompletionCommandsMissing,
    PreflightRiskGateFailed,
    HeadShaMismatch,
    BranchNotAllowed,
    WorktreeDirty,
    WorkspaceResumeGuardMismatch,
    LoopNoProgress,
    ReviewBlocker,
    ReviewIssueChecksMissing,
    ReviewIssueUnresolved,
    VerificationFailed,
    CommandTimeout,
    CommandNotFound,
    ProviderLimit,
    WatchdogTimeout,
    DeadlineReached,
    AuthorApproved,
    AuthorRejected,
    AuthorFeedbackRequested,
    AuthorConfirmationRequired,
    ConcurrencyLimit,
    StartDeduped,
    SandboxAllocationFailed,
    ForceFailed,
    AutoMergeCompleted,
}

impl GateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProposalConsensusStalledInRound => "proposal_consensus_stalled_in_round",
            Self::ProposalConsensusStalledAcrossRounds => "proposal_consensus_stalled_across_rounds",
            Self::ProposalPrecheckUnavailable => "proposal_precheck_unavailable",
            Self::ProposalReviewUnavailable => "proposal_review_unavailable",
            Self::PrecompletionEvidenceMissing => "precompletion_evidence_missing",
            Self::PrecompletionCommandsMissing => "precompletion_commands_missing",
            Self::PreflightRiskGateFailed => "preflight_risk_gate_failed",
            Self::HeadShaMismatch => "head_sha_mismatch",
            Self::BranchNotAllowed => "branch_not_allowed",
            Self::WorktreeDirty => "worktree_dirty",
            Self::WorkspaceResumeGuardMismatch => "workspace_resume_guard_mismatch",
            Self::LoopNoProgress => "loop_no_progress",
            Self::ReviewBlocker => "review_blocker",
            Self::ReviewIssueChecksMissing => "review_issue_checks_missing",
            Self::ReviewIssueUnresolved => "review_issue_unresolved",
            Self::VerificationFailed => "verification_failed",
            Self::CommandTimeout => "command_timeout",
            Self::CommandNotFound => "command_not_found",
            Self::ProviderLimit => "provider_limit",
            Self::WatchdogTimeout => "watchdog_timeout",
            Self::DeadlineReached => "deadline_reached",
            Self::AuthorApproved => "author_approved",
            Self::AuthorRejected => "author_rejected",
            Self::AuthorFeedbackRequested => "author_feedback_requested",
            Self::AuthorConfirmationRequired => "author_confirmation_required",
            Self::ConcurrencyLimit => "concurrency_limit",
            Self::StartDeduped => "start_deduped",
            Self::SandboxAllocationFailed => "sandbox_allocation_failed",
            Self::ForceFailed => "force_failed",
            Self::AutoMergeCompleted => "auto_merge_completed",
        }
    }
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The author's verdict on a consensus hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorVerdict {
    Approve,
    Reject,
    Revise,
}

impl std::fmt::Display for AuthorVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
            Self::Revise => write!(f, "revise"),
        }
    }
}

/// Recorded author decision on a `waiting_manual` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorDecision {
    pub verdict: AuthorVerdict,
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// The unit of work driven by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub workspace_path: String,
    pub sandbox_path: Option<String>,
    /// Whether `sandbox_path` was allocated by the sandbox manager (and may
    /// therefore be deleted on terminal success) or supplied by the user.
    pub sandbox_generated: bool,
    pub merge_target_path: Option<String>,
    pub author: ParticipantId,
    pub reviewers: Vec<ParticipantId>,
    pub options: TaskOptions,
    pub status: TaskStatus,
    pub rounds_completed: u32,
    pub last_gate_reason: Option<GateReason>,
    /// Stable digest over workspace state, captured at create and checked
    /// on every (re)start.
    pub workspace_fingerprint: String,
    /// Set once the author approved the consensus hand-off; unlocks the
    /// full round loop for `self_loop_mode=0` tasks.
    pub author_approved: bool,
    /// Note from a `revise` decision, threaded into the next proposal seed.
    pub revise_note: Option<String>,
    pub decision: Option<AuthorDecision>,
    pub auto_merge_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Project slug derived from the workspace path, used for sandbox and
    /// history keys.
    pub fn project_slug(&self) -> String {
        let base = std::path::Path::new(&self.workspace_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace");
        base.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect()
    }

    /// Effective execution root for implementation and verification.
    pub fn execution_root(&self) -> &str {
        if self.options.sandbox_mode {
            self.sandbox_path.as_deref().unwrap_or(&self.workspace_path)
        } else {
            &self.workspace_path
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_participant_id_parse() {
        let id = ParticipantId::parse("claude#lead").unwrap();
        assert_eq!(id.provider, Provider::Claude);
        assert_eq!(id.alias, "lead");
        assert_eq!(id.to_string(), "claude#lead");

        let ext = ParticipantId::parse("aider#fix").unwrap();
        assert_eq!(ext.provider, Provider::Extension("aider".to_string()));
    }

    #[test]
    fn test_participant_id_rejects_malformed() {
        assert_eq!(
            ParticipantId::parse("claude"),
            Err(ParticipantIdError::MissingSeparator("claude".to_string()))
        );
        assert_eq!(
            ParticipantId::parse("claude#"),
            Err(ParticipantIdError::EmptyAlias)
        );
        assert_eq!(
            ParticipantId::parse("#alias"),
            Err(ParticipantIdError::EmptyProvider)
        );
    }

    #[test]
    fn test_participant_id_serde_round_trip() {
        let id = ParticipantId::parse("codex#runner").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"codex#runner\"");
        let parsed: ParticipantId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Canceled));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Passed));

        assert!(TaskStatus::Running.can_transition_to(TaskStatus::WaitingManual));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::FailedSystem));

        assert!(TaskStatus::WaitingManual.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::WaitingManual.can_transition_to(TaskStatus::Canceled));
        assert!(!TaskStatus::WaitingManual.can_transition_to(TaskStatus::Passed));

        for terminal in [
            TaskStatus::Passed,
            TaskStatus::FailedGate,
            TaskStatus::FailedSystem,
            TaskStatus::Canceled,
        ] {
            assert!(terminal.is_terminal());
            assert!(terminal.valid_transitions().is_empty());
        }
    }

    #[test]
    fn test_options_validate_bounds() {
        let mut opts = TaskOptions::default();
        assert!(opts.validate().is_ok());

        opts.max_rounds = 0;
        assert!(opts.validate().is_err());
        opts.max_rounds = 21;
        assert!(opts.validate().is_err());
        opts.max_rounds = 20;
        assert!(opts.validate().is_ok());

        opts.evolution_level = 4;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_override_precedence() {
        let mut opts = TaskOptions::default();
        opts.provider_overrides.insert(
            "claude".to_string(),
            ParticipantOverride {
                model: Some("opus".to_string()),
                extra_args: Some("--provider-wide".to_string()),
            },
        );
        opts.participant_overrides.insert(
            "claude#lead".to_string(),
            ParticipantOverride {
                model: Some("sonnet".to_string()),
                extra_args: None,
            },
        );

        let lead = ParticipantId::parse("claude#lead").unwrap();
        let merged = opts.override_for(&lead);
        assert_eq!(merged.model.as_deref(), Some("sonnet"));
        // Unset participant field falls back to the provider entry.
        assert_eq!(merged.extra_args.as_deref(), Some("--provider-wide"));

        let other = ParticipantId::parse("claude#second").unwrap();
        let merged = opts.override_for(&other);
        assert_eq!(merged.model.as_deref(), Some("opus"));
    }

    #[test]
    fn test_multi_agent_flags_become_adapter_args() {
        let mut opts = TaskOptions::default();
        opts.claude_team_agents = Some(true);
        opts.provider_overrides.insert(
            "claude".to_string(),
            ParticipantOverride {
                model: None,
                extra_args: Some("--fast".to_string()),
            },
        );

        let claude = ParticipantId::parse("claude#lead").unwrap();
        assert_eq!(
            opts.override_for(&claude).extra_args.as_deref(),
            Some("--fast --team-agents")
        );

        // Flag only applies to the provider it names.
        let codex = ParticipantId::parse("codex#rev").unwrap();
        assert_eq!(opts.override_for(&codex).extra_args, None);
    }

    #[test]
    fn test_gate_reason_strings() {
        assert_eq!(
            GateReason::ProposalConsensusStalledInRound.to_string(),
            "proposal_consensus_stalled_in_round"
        );
        assert_eq!(
            GateReason::WorkspaceResumeGuardMismatch.to_string(),
            "workspace_resume_guard_mismatch"
        );
        let json = serde_json::to_string(&GateReason::LoopNoProgress).unwrap();
        assert_eq!(json, "\"loop_no_progress\"");
    }

    #[test]
    fn test_project_slug() {
        let mut task = test_task();
        task.workspace_path = "/home/dev/My Project".to_string();
        assert_eq!(task.project_slug(), "my-project");
    }

    #[test]
    fn test_execution_root_prefers_sandbox() {
        let mut task = test_task();
        task.options.sandbox_mode = true;
        task.sandbox_path = Some("/tmp/lab/x".to_string());
        assert_eq!(task.execution_root(), "/tmp/lab/x");

        task.options.sandbox_mode = false;
        assert_eq!(task.execution_root(), "/ws");
    }

    pub(crate) fn test_task() -> Task {
        Task {
            id: "t-1".to_string(),
            title: "test".to_string(),
            description: String::new(),
            workspace_path: "/ws".to_string(),
            sandbox_path: None,
            sandbox_generated: false,
            merge_target_path: None,
            author: ParticipantId::parse("claude#author").unwrap(),
            reviewers: vec![ParticipantId::parse("codex#rev").unwrap()],
            options: TaskOptions::default(),
            status: TaskStatus::Queued,
            rounds_completed: 0,
            last_gate_reason: None,
            workspace_fingerprint: "fp".to_string(),
            author_approved: false,
            revise_note: None,
            decision: None,
            auto_merge_completed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            terminated_at: None,
        }
    }
}

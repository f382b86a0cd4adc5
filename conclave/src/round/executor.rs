//! One full-workflow round: optional debate, discussion, implementation,
//! review, verification, and the gate decision.
//!
//! Reviewer outages degrade to an `unknown` verdict with a `review_error`
//! event; the round keeps going. Only system-wide failures (author binary
//! missing, every reviewer unavailable) escalate to `failed_system`. The
//! round artifact is always written before the `gate_decision` event.

use std::path::PathBuf;
use std::process::Command as StdCommand;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::progress::{ProgressDecision, ProgressTracker};
use super::verification::{run_verification, VerificationReport};
use crate::consensus::machine::{push_language, verdict_format};
use crate::consensus::{issue_signature, normalize_audit_verdict, ReviewVerdict, ReviewerVerdict};
use crate::gateway::{InvokeOutcome, InvokeRequest, ParticipantGateway, Phase};
use crate::guards::evidence::extract_paths;
use crate::guards::{EvidenceDecision, EvidenceGuard, EvidenceInput};
use crate::sandbox::copy_filtered_tree;
use crate::store::{ArtifactStore, TaskRepository};
use crate::task::{EventKind, GateReason, ParticipantId, Task, TaskEvent};

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct RoundConfig {
    /// Fallback per-call deadline when the task sets no phase timeout.
    pub default_phase_timeout: Duration,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            default_phase_timeout: Duration::from_secs(1800),
        }
    }
}

/// Outcome of one round, classified for the coordinator.
#[derive(Debug, Clone)]
pub struct RoundResult {
    pub round: u32,
    pub passed: bool,
    pub reason: Option<GateReason>,
    pub detail: String,
    /// Environment-level failure; skips the retry loop.
    pub system_failure: bool,
    /// Strategy shifts exhausted without progress.
    pub no_progress: bool,
    pub evidence_bundle: Option<String>,
}

impl RoundResult {
    fn gate_fail(round: u32, reason: GateReason, detail: impl Into<String>) -> Self {
        Self {
            round,
            passed: false,
            reason: Some(reason),
            detail: detail.into(),
            system_failure: false,
            no_progress: false,
            evidence_bundle: None,
        }
    }

    fn system_fail(round: u32, detail: impl Into<String>) -> Self {
        Self {
            round,
            passed: false,
            reason: None,
            detail: detail.into(),
            system_failure: true,
            no_progress: false,
            evidence_bundle: None,
        }
    }
}

/// One reviewer's collected verdict for the round.
struct RoundReview {
    participant: ParticipantId,
    verdict: ReviewerVerdict,
    /// The invocation itself failed; the verdict is synthetic.
    errored: bool,
}

/// Executes rounds for the coordinator.
pub struct RoundExecutor<'a> {
    gateway: &'a dyn ParticipantGateway,
    repo: &'a dyn TaskRepository,
    artifacts: &'a ArtifactStore,
    config: RoundConfig,
}

impl<'a> RoundExecutor<'a> {
    pub fn new(
        gateway: &'a dyn ParticipantGateway,
        repo: &'a dyn TaskRepository,
        artifacts: &'a ArtifactStore,
        config: RoundConfig,
    ) -> Self {
        Self {
            gateway,
            repo,
            artifacts,
            config,
        }
    }

    /// Run round `round` for `task`. `prior_reason` is last round's gate
    /// reason; the tracker carries loop-progress state across rounds.
    pub async fn run(
        &self,
        task: &Task,
        round: u32,
        tracker: &mut ProgressTracker,
        prior_reason: Option<GateReason>,
        cancel: &CancellationToken,
    ) -> RoundResult {
        info!(task_id = %task.id, round, "round started");

        // Optional reviewer-first debate surfaces concerns the discussion
        // must address; blockers become the round's issue contract.
        let mut required_ids: Vec<String> = Vec::new();
        let mut debate_notes: Vec<String> = Vec::new();
        if task.options.debate_mode {
            let reviews = self
                .collect_reviews(task, Phase::Precheck, &self.debate_prompt(task, round), cancel)
                .await;
            if let Some(result) = self.all_unavailable(task, round, &reviews) {
                return result;
            }
            for review in &reviews {
                for id in review.verdict.open_issue_ids() {
                    if !required_ids.contains(&id) {
                        required_ids.push(id);
                    }
                }
                if !review.verdict.reason.is_empty() {
                    debate_notes.push(review.verdict.reason.clone());
                }
            }
        }

        // Discussion: the author plans, seeded with why the last round
        // failed and any pending strategy hint.
        self.emit(task, EventKind::DiscussionStarted, json!({"round": round}), None);
        let discussion_prompt =
            self.discussion_prompt(task, round, prior_reason, tracker.pending_hint(), &debate_notes, &required_ids);
        let plan = match self
            .invoke(task, &task.author, Phase::Discussion, &discussion_prompt, cancel)
            .await
        {
            InvokeOutcome::Ok { text, .. } => text,
            InvokeOutcome::NotFound => {
                return RoundResult::system_fail(round, "author executable missing");
            }
            InvokeOutcome::RuntimeError { detail } => {
                return RoundResult::system_fail(round, format!("author failed: {}", detail));
            }
            InvokeOutcome::Timeout { after_secs } => {
                return RoundResult::gate_fail(
                    round,
                    GateReason::CommandTimeout,
                    format!("author discussion timed out after {}s", after_secs),
                );
            }
            InvokeOutcome::ProviderLimit { detail } => {
                return RoundResult::gate_fail(round, GateReason::ProviderLimit, detail);
            }
        };
        self.append_discussion(task, round, &plan);

        // Implementation: the author changes code in the execution root.
        self.emit(task, EventKind::ImplementationStarted, json!({"round": round}), None);
        let implementation = match self
            .invoke(
                task,
                &task.author,
                Phase::Implementation,
                &self.implementation_prompt(task, round, &plan),
                cancel,
            )
            .await
        {
            InvokeOutcome::Ok { text, .. } => text,
            InvokeOutcome::NotFound => {
                return RoundResult::system_fail(round, "author executable missing");
            }
            InvokeOutcome::RuntimeError { detail } => {
                return RoundResult::system_fail(round, format!("author failed: {}", detail));
            }
            InvokeOutcome::Timeout { after_secs } => {
                return RoundResult::gate_fail(
                    round,
                    GateReason::CommandTimeout,
                    format!("author implementation timed out after {}s", after_secs),
                );
            }
            InvokeOutcome::ProviderLimit { detail } => {
                return RoundResult::gate_fail(round, GateReason::ProviderLimit, detail);
            }
        };

        // Review: reviewer fan-out with per-reviewer degradation.
        self.emit(task, EventKind::ReviewStarted, json!({"round": round}), None);
        let reviews = self
            .collect_reviews(
                task,
                Phase::Review,
                &self.review_prompt(task, round, &implementation, &required_ids),
                cancel,
            )
            .await;
        if let Some(result) = self.all_unavailable(task, round, &reviews) {
            return result;
        }

        // Contract enforcement: declared issue ids must be checked off.
        let mut hard_fail: Option<(GateReason, String)> = None;
        if !required_ids.is_empty() {
            for review in reviews.iter().filter(|r| !r.errored) {
                let missing: Vec<&String> = required_ids
                    .iter()
                    .filter(|id| {
                        !review
                            .verdict
                            .issue_checks
                            .iter()
                            .any(|c| &c.issue_id == *id)
                    })
                    .collect();
                if !missing.is_empty() {
                    hard_fail = Some((
                        GateReason::ReviewIssueChecksMissing,
                        format!(
                            "{} did not check {}",
                            review.participant,
                            missing
                                .iter()
                                .map(|s| s.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        ),
                    ));
                    break;
                }
                if let Some(unresolved) = review
                    .verdict
                    .issue_checks
                    .iter()
                    .find(|c| required_ids.contains(&c.issue_id) && !c.resolved)
                {
                    hard_fail = Some((
                        GateReason::ReviewIssueUnresolved,
                        format!("{} still open: {}", unresolved.issue_id, unresolved.note),
                    ));
                    break;
                }
            }
        }

        let all_no_blocker = reviews
            .iter()
            .all(|r| r.verdict.verdict == ReviewVerdict::NoBlocker);

        // Verification runs even when review raised blockers so the next
        // round starts from observed reality, but a contract hard-fail
        // short-circuits straight to the gate.
        let verification = if hard_fail.is_none() {
            self.emit(task, EventKind::VerificationStarted, json!({"round": round}), None);
            let command_timeout = task
                .options
                .phase_timeouts
                .verification_secs
                .unwrap_or(task.options.command_timeout_secs);
            run_verification(
                &PathBuf::from(task.execution_root()),
                task.options.test_command.as_deref(),
                task.options.lint_command.as_deref(),
                Duration::from_secs(command_timeout),
                cancel,
            )
            .await
        } else {
            VerificationReport::default()
        };

        // Gate decision.
        let mut evidence_bundle = None;
        let (passed, reason, detail) = if let Some((reason, detail)) = hard_fail {
            (false, Some(reason), detail)
        } else if !all_no_blocker {
            let blockers: Vec<String> = reviews
                .iter()
                .filter(|r| r.verdict.verdict != ReviewVerdict::NoBlocker)
                .map(|r| format!("{}={}", r.participant, r.verdict.verdict))
                .collect();
            (
                false,
                Some(GateReason::ReviewBlocker),
                blockers.join(", "),
            )
        } else if let Some(reason) = verification.failure_reason() {
            (false, Some(reason), verification.combined_output())
        } else {
            let input = EvidenceInput {
                verification_executed: verification.executed,
                commands: verification.commands.clone(),
                implementation_paths: extract_paths(&implementation),
                verification_paths: extract_paths(&verification.combined_output()),
            };
            match EvidenceGuard::verify(self.artifacts, &task.id, round, &input) {
                EvidenceDecision::Pass { bundle_path } => {
                    evidence_bundle = Some(bundle_path);
                    (true, None, String::new())
                }
                EvidenceDecision::Fail { reason, detail } => {
                    let artifact = json!({
                        "round": round,
                        "reason": reason,
                        "detail": detail.clone(),
                    });
                    if let Err(e) = self.artifacts.write_json(
                        &task.id,
                        "artifacts/precompletion_guard_failed.json",
                        &artifact,
                    ) {
                        warn!(task_id = %task.id, error = %e, "guard artifact write failed");
                    }
                    self.emit(
                        task,
                        EventKind::PrecompletionChecklist,
                        artifact,
                        None,
                    );
                    (false, Some(reason), detail)
                }
            }
        };

        // Loop-progress bookkeeping only matters for failed rounds.
        let mut no_progress = false;
        if !passed {
            let review_sig = issue_signature(
                &reviews
                    .iter()
                    .flat_map(|r| r.verdict.open_issue_ids())
                    .chain(reason.iter().map(|r| r.to_string()))
                    .collect::<Vec<_>>(),
            );
            match tracker.observe(&implementation, &review_sig) {
                ProgressDecision::Progressing => {}
                ProgressDecision::Shift { hint } => {
                    self.emit(
                        task,
                        EventKind::StrategyShifted,
                        json!({"round": round, "hint": hint, "shifts": tracker.shifts()}),
                        None,
                    );
                }
                ProgressDecision::NoProgress => no_progress = true,
            }
        }

        // Round artifact first, then the gate event.
        let round_artifact = json!({
            "round": round,
            "passed": passed,
            "reason": reason,
            "detail": detail.clone(),
            "reviews": reviews
                .iter()
                .map(|r| json!({
                    "participant": r.participant.to_string(),
                    "verdict": r.verdict.verdict.to_string(),
                    "issues": r.verdict.open_issue_ids(),
                    "errored": r.errored,
                }))
                .collect::<Vec<_>>(),
            "verification": {
                "executed": verification.executed,
                "success": verification.success,
                "commands": verification.commands,
            },
            "evidence_bundle": evidence_bundle.clone(),
        });
        if let Err(e) = self.artifacts.write_json(
            &task.id,
            &format!("artifacts/rounds/round-{}-artifact.json", round),
            &round_artifact,
        ) {
            warn!(task_id = %task.id, error = %e, "round artifact write failed");
        }

        if task.options.max_rounds > 1 && !task.options.auto_merge {
            self.write_candidate_artifacts(task, round, &implementation, passed, &reason);
        }

        self.emit(
            task,
            EventKind::GateDecision,
            json!({
                "round": round,
                "passed": passed,
                "reason": reason,
                "no_progress": no_progress,
            }),
            None,
        );
        debug!(task_id = %task.id, round, passed, ?reason, "gate decision");

        RoundResult {
            round,
            passed,
            reason,
            detail,
            system_failure: false,
            no_progress,
            evidence_bundle,
        }
    }

    /// Multi-round candidate mode: per-round patch, notes, and snapshot so
    /// any round can be promoted later without disturbing the others.
    fn write_candidate_artifacts(
        &self,
        task: &Task,
        round: u32,
        implementation: &str,
        passed: bool,
        reason: &Option<GateReason>,
    ) {
        let patch = git_diff(&PathBuf::from(task.execution_root()));
        if let Err(e) = self.artifacts.write_artifact(
            &task.id,
            &format!("artifacts/rounds/round-{}.patch", round),
            patch.as_bytes(),
        ) {
            warn!(task_id = %task.id, error = %e, "round patch write failed");
        }

        let notes = format!(
            "# Round {round}\n\nstatus: {status}\n\n## Implementation\n\n{implementation}\n",
            round = round,
            status = match (passed, reason) {
                (true, _) => "passed".to_string(),
                (false, Some(reason)) => reason.to_string(),
                (false, None) => "failed".to_string(),
            },
            implementation = implementation,
        );
        if let Err(e) = self.artifacts.write_artifact(
            &task.id,
            &format!("artifacts/rounds/round-{}.md", round),
            notes.as_bytes(),
        ) {
            warn!(task_id = %task.id, error = %e, "round notes write failed");
        }

        match self.artifacts.task_dir(&task.id) {
            Ok(task_dir) => {
                let snapshot = task_dir
                    .join("artifacts/rounds")
                    .join(format!("round-{:03}-snapshot", round));
                if let Err(e) =
                    copy_filtered_tree(&PathBuf::from(task.execution_root()), &snapshot)
                {
                    warn!(task_id = %task.id, error = %e, "round snapshot failed");
                }
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "snapshot dir resolution failed"),
        }
    }

    /// All-reviewers-unavailable check; escalates to a system failure.
    fn all_unavailable(
        &self,
        task: &Task,
        round: u32,
        reviews: &[RoundReview],
    ) -> Option<RoundResult> {
        if !reviews.is_empty() && reviews.iter().all(|r| r.errored) {
            warn!(task_id = %task.id, round, "every reviewer unavailable");
            return Some(RoundResult::system_fail(
                round,
                "all reviewers unavailable",
            ));
        }
        None
    }

    async fn collect_reviews(
        &self,
        task: &Task,
        phase: Phase,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Vec<RoundReview> {
        let calls = task.reviewers.iter().map(|reviewer| {
            let reviewer = reviewer.clone();
            async move {
                let outcome = self.invoke(task, &reviewer, phase, prompt, cancel).await;
                (reviewer, outcome)
            }
        });
        let outcomes = futures::future::join_all(calls).await;

        let mut reviews = Vec::with_capacity(outcomes.len());
        for (participant, outcome) in outcomes {
            match outcome {
                InvokeOutcome::Ok { text, .. } => {
                    let verdict = match ReviewerVerdict::parse(&text) {
                        Some((verdict, _)) => {
                            normalize_audit_verdict(verdict, &task.description)
                        }
                        None => ReviewerVerdict::unavailable("unparseable output"),
                    };
                    reviews.push(RoundReview {
                        participant,
                        verdict,
                        errored: false,
                    });
                }
                outcome => {
                    // A single reviewer outage degrades to unknown.
                    self.emit(
                        task,
                        EventKind::ReviewError,
                        json!({"phase": phase.to_string(), "class": outcome.class()}),
                        Some(participant.clone()),
                    );
                    reviews.push(RoundReview {
                        participant,
                        verdict: ReviewerVerdict::unavailable(outcome.class()),
                        errored: true,
                    });
                }
            }
        }
        reviews
    }

    async fn invoke(
        &self,
        task: &Task,
        participant: &ParticipantId,
        phase: Phase,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> InvokeOutcome {
        let timeout_secs = match phase {
            Phase::Discussion => task.options.phase_timeouts.discussion_secs,
            Phase::Implementation => task.options.phase_timeouts.implementation_secs,
            _ => task.options.phase_timeouts.review_secs,
        };
        let deadline = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_phase_timeout);

        let request = InvokeRequest {
            participant: participant.clone(),
            phase,
            prompt: prompt.to_string(),
            working_dir: PathBuf::from(task.execution_root()),
            overrides: task.options.override_for(participant),
            deadline,
            stream: task.options.stream_mode,
        };
        let outcome = self.gateway.invoke(request, cancel).await;

        if let InvokeOutcome::Ok { stream_events, .. } = &outcome {
            for chunk in stream_events {
                self.emit(
                    task,
                    EventKind::ParticipantStream,
                    json!({"phase": phase.to_string(), "chunk": chunk.chunk}),
                    Some(participant.clone()),
                );
            }
        }
        outcome
    }

    fn append_discussion(&self, task: &Task, round: u32, plan: &str) {
        let mut existing = self
            .artifacts
            .read_artifact(&task.id, "discussion.md")
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        existing.push_str(&format!("\n## Round {}\n\n{}\n", round, plan));
        if let Err(e) = self
            .artifacts
            .write_artifact(&task.id, "discussion.md", existing.as_bytes())
        {
            warn!(task_id = %task.id, error = %e, "discussion append failed");
        }
    }

    fn emit(
        &self,
        task: &Task,
        kind: EventKind,
        payload: serde_json::Value,
        participant: Option<ParticipantId>,
    ) {
        let mut event = TaskEvent::new(&task.id, kind).with_payload(payload);
        if let Some(participant) = participant {
            event = event.with_participant(participant);
        }
        if let Err(e) = self.repo.append_event(event) {
            warn!(task_id = %task.id, kind = %kind, error = %e, "event append failed");
        }
    }

    fn debate_prompt(&self, task: &Task, round: u32) -> String {
        let mut prompt = format!(
            "You are a reviewer on task {title:?} (round {round}).\nBefore implementation starts, raise any blocking concern.\n{format}",
            title = task.title,
            round = round,
            format = verdict_format(task),
        );
        push_language(task, &mut prompt);
        prompt
    }

    fn discussion_prompt(
        &self,
        task: &Task,
        round: u32,
        prior_reason: Option<GateReason>,
        hint: Option<&str>,
        debate_notes: &[String],
        required_ids: &[String],
    ) -> String {
        let mut prompt = format!(
            "You are the author on task {title:?} (round {round}).\n{description}\n\nWrite the plan for this round.",
            title = task.title,
            round = round,
            description = task.description,
        );
        if let Some(reason) = prior_reason {
            prompt.push_str(&format!("\nThe previous round failed its gate with: {}.", reason));
        }
        if let Some(hint) = hint {
            prompt.push_str(&format!("\nStrategy shift for this round: {}.", hint));
        }
        if !debate_notes.is_empty() {
            prompt.push_str(&format!("\nReviewer concerns: {}", debate_notes.join("; ")));
        }
        if !required_ids.is_empty() {
            prompt.push_str(&format!(
                "\nThe plan must address: {}.",
                required_ids.join(", ")
            ));
        }
        if task.options.memory_mode != crate::task::MemoryMode::Off {
            if let Some(memory) = self.round_memory(task) {
                prompt.push_str(&format!("\n\nEarlier rounds for context:\n{}", memory));
            }
        }
        push_language(task, &mut prompt);
        prompt
    }

    /// Tail of the accumulated discussion log, fed back into later rounds
    /// when the task keeps cross-round memory.
    fn round_memory(&self, task: &Task) -> Option<String> {
        let bytes = self.artifacts.read_artifact(&task.id, "discussion.md").ok()?;
        let text = String::from_utf8_lossy(&bytes);
        let budget = match task.options.memory_mode {
            crate::task::MemoryMode::Strict => 8192,
            _ => 2048,
        };
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let mut start = text.len().saturating_sub(budget);
        while !text.is_char_boundary(start) {
            start += 1;
        }
        Some(text[start..].to_string())
    }

    fn implementation_prompt(&self, task: &Task, round: u32, plan: &str) -> String {
        let mut prompt = format!(
            "You are the author on task {title:?} (round {round}, repair mode {repair}, evolution level {level}).\nApply this plan in the working directory, then summarize what changed with file paths:\n{plan}",
            title = task.title,
            round = round,
            repair = task.options.repair_mode,
            level = task.options.evolution_level,
            plan = plan,
        );
        push_language(task, &mut prompt);
        prompt
    }

    fn review_prompt(
        &self,
        task: &Task,
        round: u32,
        implementation: &str,
        required_ids: &[String],
    ) -> String {
        let mut prompt = format!(
            "You are a reviewer on task {title:?} (round {round}).\nThe author reports:\n{implementation}\n\nReview the working directory.",
            title = task.title,
            round = round,
            implementation = implementation,
        );
        if !required_ids.is_empty() {
            prompt.push_str(&format!(
                "\nCheck each declared issue id in issue_checks: {}.",
                required_ids.join(", ")
            ));
        }
        prompt.push('\n');
        prompt.push_str(verdict_format(task));
        push_language(task, &mut prompt);
        prompt
    }
}

/// Diff of the execution root via git, empty when not a repository. The
/// orchestrator never computes diffs itself.
fn git_diff(root: &PathBuf) -> String {
    let output = StdCommand::new("git")
        .args(["diff", "HEAD"])
        .current_dir(root)
        .output();
    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).into_owned(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskRepository;
    use crate::testutil::{fixture, ScriptedGateway};

    const NO_BLOCKER: &str = r#"{"verdict": "no_blocker", "issues": [], "reason": ""}"#;
    const BLOCKER: &str = r#"{"verdict": "blocker", "issues": [{"issue_id": "ISSUE-001", "detail": "broken"}], "reason": "broken"}"#;
    const IMPL_WITH_PATHS: &str = "Refactored the retry loop in src/retry.rs and added tests/retry_test.rs";
    const IMPL_NO_PATHS: &str = "Everything is done and working now";

    fn round_task() -> (Task, tempfile::TempDir) {
        let (mut task, dir) = crate::testutil::task_with_workspace();
        task.options.sandbox_mode = false;
        task.options.debate_mode = false;
        task.options.max_rounds = 1;
        task.options.test_command = Some("echo test log in target/test.log".to_string());
        task.options.lint_command = None;
        (task, dir)
    }

    fn executor_fixtures(
        task: &Task,
    ) -> (crate::store::MemoryRepository, crate::store::ArtifactStore, tempfile::TempDir) {
        let (repo, artifacts, dir) = fixture();
        repo.create_task(task.clone()).unwrap();
        (repo, artifacts, dir)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_passing_round_produces_evidence() {
        let (task, _ws) = round_task();
        let (repo, artifacts, _dir) = executor_fixtures(&task);

        let gateway = ScriptedGateway::new();
        gateway.script("claude#author", Phase::Discussion, vec![ScriptedGateway::ok("plan")]);
        gateway.script(
            "claude#author",
            Phase::Implementation,
            vec![ScriptedGateway::ok(IMPL_WITH_PATHS)],
        );
        gateway.script("codex#rev", Phase::Review, vec![ScriptedGateway::ok(NO_BLOCKER)]);

        let executor =
            RoundExecutor::new(&gateway, &repo, &artifacts, RoundConfig::default());
        let mut tracker = ProgressTracker::new(2);
        let result = executor
            .run(&task, 1, &mut tracker, None, &CancellationToken::new())
            .await;

        assert!(result.passed, "round failed: {:?} {}", result.reason, result.detail);
        assert!(artifacts.artifact_exists(&task.id, "artifacts/evidence_bundle_round_1.json"));
        assert!(artifacts.artifact_exists(&task.id, "artifacts/rounds/round-1-artifact.json"));

        // No strategy shift on a single passing round.
        let events = repo.read_events(&task.id).unwrap();
        assert!(!events.iter().any(|e| e.kind == EventKind::StrategyShifted));
        let gate = events
            .iter()
            .find(|e| e.kind == EventKind::GateDecision)
            .unwrap();
        assert_eq!(gate.payload["passed"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_review_blocker_fails_gate() {
        let (task, _ws) = round_task();
        let (repo, artifacts, _dir) = executor_fixtures(&task);

        let gateway = ScriptedGateway::new();
        gateway.script("claude#author", Phase::Discussion, vec![ScriptedGateway::ok("plan")]);
        gateway.script(
            "claude#author",
            Phase::Implementation,
            vec![ScriptedGateway::ok(IMPL_WITH_PATHS)],
        );
        gateway.script("codex#rev", Phase::Review, vec![ScriptedGateway::ok(BLOCKER)]);

        let executor =
            RoundExecutor::new(&gateway, &repo, &artifacts, RoundConfig::default());
        let mut tracker = ProgressTracker::new(2);
        let result = executor
            .run(&task, 1, &mut tracker, None, &CancellationToken::new())
            .await;

        assert!(!result.passed);
        assert_eq!(result.reason, Some(GateReason::ReviewBlocker));
        assert!(!result.system_failure);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_evidence_paths_fail_evidence_gate() {
        let (task, _ws) = round_task();
        let (repo, artifacts, _dir) = executor_fixtures(&task);

        let gateway = ScriptedGateway::new();
        gateway.script("claude#author", Phase::Discussion, vec![ScriptedGateway::ok("plan")]);
        gateway.script(
            "claude#author",
            Phase::Implementation,
            vec![ScriptedGateway::ok(IMPL_NO_PATHS)],
        );
        gateway.script("codex#rev", Phase::Review, vec![ScriptedGateway::ok(NO_BLOCKER)]);

        let executor =
            RoundExecutor::new(&gateway, &repo, &artifacts, RoundConfig::default());
        let mut tracker = ProgressTracker::new(2);
        let result = executor
            .run(&task, 1, &mut tracker, None, &CancellationToken::new())
            .await;

        assert!(!result.passed);
        assert_eq!(result.reason, Some(GateReason::PrecompletionEvidenceMissing));
        assert!(artifacts.artifact_exists(&task.id, "artifacts/precompletion_guard_failed.json"));
        assert!(!artifacts.artifact_exists(&task.id, "artifacts/evidence_bundle_round_1.json"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_reviewer_outage_degrades() {
        let (mut task, _ws) = round_task();
        task.reviewers.push(crate::task::ParticipantId::parse("gemini#second").unwrap());
        let (repo, artifacts, _dir) = executor_fixtures(&task);

        let gateway = ScriptedGateway::new();
        gateway.script("claude#author", Phase::Discussion, vec![ScriptedGateway::ok("plan")]);
        gateway.script(
            "claude#author",
            Phase::Implementation,
            vec![ScriptedGateway::ok(IMPL_WITH_PATHS)],
        );
        gateway.script("codex#rev", Phase::Review, vec![ScriptedGateway::ok(NO_BLOCKER)]);
        // gemini#second is unscripted: behaves as not_found, degrades.

        let executor =
            RoundExecutor::new(&gateway, &repo, &artifacts, RoundConfig::default());
        let mut tracker = ProgressTracker::new(2);
        let result = executor
            .run(&task, 1, &mut tracker, None, &CancellationToken::new())
            .await;

        // Degraded reviewer counts as unknown, so the gate fails, but the
        // task survives with a retryable reason.
        assert!(!result.passed);
        assert!(!result.system_failure);
        assert_eq!(result.reason, Some(GateReason::ReviewBlocker));

        let events = repo.read_events(&task.id).unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::ReviewError));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_all_reviewers_unavailable_is_system_failure() {
        let (task, _ws) = round_task();
        let (repo, artifacts, _dir) = executor_fixtures(&task);

        let gateway = ScriptedGateway::new();
        gateway.script("claude#author", Phase::Discussion, vec![ScriptedGateway::ok("plan")]);
        gateway.script(
            "claude#author",
            Phase::Implementation,
            vec![ScriptedGateway::ok(IMPL_WITH_PATHS)],
        );
        // Reviewer unscripted: not_found.

        let executor =
            RoundExecutor::new(&gateway, &repo, &artifacts, RoundConfig::default());
        let mut tracker = ProgressTracker::new(2);
        let result = executor
            .run(&task, 1, &mut tracker, None, &CancellationToken::new())
            .await;

        assert!(result.system_failure);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_issue_checks_enforced_when_contract_declared() {
        let (mut task, _ws) = round_task();
        task.options.debate_mode = true;
        let (repo, artifacts, _dir) = executor_fixtures(&task);

        let gateway = ScriptedGateway::new();
        gateway.script("codex#rev", Phase::Precheck, vec![ScriptedGateway::ok(BLOCKER)]);
        gateway.script("claude#author", Phase::Discussion, vec![ScriptedGateway::ok("plan")]);
        gateway.script(
            "claude#author",
            Phase::Implementation,
            vec![ScriptedGateway::ok(IMPL_WITH_PATHS)],
        );
        // Review returns no_blocker but never checks ISSUE-001.
        gateway.script("codex#rev", Phase::Review, vec![ScriptedGateway::ok(NO_BLOCKER)]);

        let executor =
            RoundExecutor::new(&gateway, &repo, &artifacts, RoundConfig::default());
        let mut tracker = ProgressTracker::new(2);
        let result = executor
            .run(&task, 1, &mut tracker, None, &CancellationToken::new())
            .await;

        assert!(!result.passed);
        assert_eq!(result.reason, Some(GateReason::ReviewIssueChecksMissing));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_candidate_mode_writes_patch_notes_snapshot() {
        let (mut task, _ws) = round_task();
        task.options.max_rounds = 3;
        task.options.auto_merge = false;
        let (repo, artifacts, _dir) = executor_fixtures(&task);

        let gateway = ScriptedGateway::new();
        gateway.script("claude#author", Phase::Discussion, vec![ScriptedGateway::ok("plan")]);
        gateway.script(
            "claude#author",
            Phase::Implementation,
            vec![ScriptedGateway::ok(IMPL_WITH_PATHS)],
        );
        gateway.script("codex#rev", Phase::Review, vec![ScriptedGateway::ok(NO_BLOCKER)]);

        let executor =
            RoundExecutor::new(&gateway, &repo, &artifacts, RoundConfig::default());
        let mut tracker = ProgressTracker::new(2);
        let result = executor
            .run(&task, 2, &mut tracker, None, &CancellationToken::new())
            .await;

        assert!(result.passed);
        assert!(artifacts.artifact_exists(&task.id, "artifacts/rounds/round-2.patch"));
        assert!(artifacts.artifact_exists(&task.id, "artifacts/rounds/round-2.md"));
        let snapshot = artifacts
            .task_dir(&task.id)
            .unwrap()
            .join("artifacts/rounds/round-002-snapshot");
        assert!(snapshot.is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_strategy_shift_then_no_progress() {
        let (mut task, _ws) = round_task();
        task.options.max_rounds = 5;
        let (repo, artifacts, _dir) = executor_fixtures(&task);

        let gateway = ScriptedGateway::new();
        gateway.script("claude#author", Phase::Discussion, vec![ScriptedGateway::ok("plan")]);
        gateway.script(
            "claude#author",
            Phase::Implementation,
            vec![ScriptedGateway::ok(IMPL_WITH_PATHS)],
        );
        gateway.script("codex#rev", Phase::Review, vec![ScriptedGateway::ok(BLOCKER)]);

        let executor =
            RoundExecutor::new(&gateway, &repo, &artifacts, RoundConfig::default());
        let mut tracker = ProgressTracker::new(1);
        let cancel = CancellationToken::new();

        let r1 = executor.run(&task, 1, &mut tracker, None, &cancel).await;
        assert!(!r1.no_progress);

        let r2 = executor.run(&task, 2, &mut tracker, r1.reason, &cancel).await;
        assert!(!r2.no_progress); // shift issued

        let r3 = executor.run(&task, 3, &mut tracker, r2.reason, &cancel).await;
        assert!(r3.no_progress);

        let events = repo.read_events(&task.id).unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::StrategyShifted));
    }
}

//! Task coordinator — drives one task from `queued` to a terminal status.
//!
//! Order of operations on start: admission, workspace resume guard,
//! preflight risk gate, sandbox allocation, consensus (when the workflow is
//! reviewer-gated and the author has not yet approved), then the round
//! loop. `evolve_until` takes precedence as the stop condition; `max_rounds`
//! is consulted only in its absence. Cancellation is cooperative through
//! the task token; force-fail wins races via the repository's CAS.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admission::{AdmissionDecision, AdmissionPermit, AdmissionScheduler, ProviderRoute};
use crate::consensus::{ConsensusConfig, ConsensusMachine, ConsensusOutcome};
use crate::gateway::ParticipantGateway;
use crate::guards::{
    EvidenceGuard, HeadSnapshot, PreflightRiskGate, PromotionGuard, ResumeCheck,
};
use crate::history::ProjectHistoryEntry;
use crate::round::{ProgressTracker, RoundConfig, RoundExecutor};
use crate::sandbox::{copy_filtered_tree, SandboxManager};
use crate::store::repository::RuntimeUpdate;
use crate::store::{SharedRepository, StoreError, StoreResult};
use crate::task::{EventKind, GateReason, Task, TaskEvent, TaskStatus};

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub consensus: ConsensusConfig,
    pub round: RoundConfig,
    /// Strategy shifts tolerated before `loop_no_progress`.
    pub strategy_shift_limit: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            consensus: ConsensusConfig::default(),
            round: RoundConfig::default(),
            strategy_shift_limit: 2,
        }
    }
}

/// Drives tasks to completion. One coordinator serves the whole process;
/// each started task runs in its own tokio task.
pub struct TaskCoordinator {
    gateway: Arc<dyn ParticipantGateway>,
    repo: SharedRepository,
    artifacts: crate::store::ArtifactStore,
    sandboxes: SandboxManager,
    admission: AdmissionScheduler,
    config: CoordinatorConfig,
}

impl TaskCoordinator {
    pub fn new(
        gateway: Arc<dyn ParticipantGateway>,
        repo: SharedRepository,
        artifacts: crate::store::ArtifactStore,
        sandboxes: SandboxManager,
        admission: AdmissionScheduler,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            gateway,
            repo,
            artifacts,
            sandboxes,
            admission,
            config,
        }
    }

    /// Run `task_id` until it reaches a terminal or `waiting_manual`
    /// status. Returns the task as last observed.
    pub async fn run_task(&self, task_id: &str, cancel: CancellationToken) -> StoreResult<Task> {
        let task = self
            .repo
            .get_task(task_id)?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Queued {
            // Either already running (dedup is handled by admission) or a
            // decision landed first.
            self.emit(&task.id, EventKind::StartDeduped, json!({"status": task.status}));
            return Ok(task);
        }

        // Admission first: nothing observable happens to a refused start
        // except the deferral event.
        let _permit = match self.admit(&task, &cancel).await {
            Some(permit) => permit,
            None => return self.repo.get_task(task_id)?.ok_or_else(|| StoreError::NotFound(task_id.to_string())),
        };

        // Provider cooldown routing for the author.
        let task = match self.route_author(task, &cancel).await {
            Some(task) => task,
            None => return self.repo.get_task(task_id)?.ok_or_else(|| StoreError::NotFound(task_id.to_string())),
        };

        let task = match self.transition(&task.id, TaskStatus::Queued, TaskStatus::Running, None) {
            Some(task) => task,
            None => return self.current(task_id),
        };
        self.emit(&task.id, EventKind::Started, json!({"author": task.author.to_string()}));

        // Deadline already expired: terminate before any adapter call.
        if deadline_passed(&task) {
            return self.finish(
                &task.id,
                TaskStatus::Canceled,
                Some(GateReason::DeadlineReached),
                json!({"at": Utc::now()}),
            );
        }

        // Workspace resume guard.
        let resume = ResumeCheck::run(&task);
        if !resume.matches {
            if let Err(e) = self.artifacts.write_json(
                &task.id,
                "artifacts/workspace_resume_guard.json",
                &resume,
            ) {
                warn!(task_id = %task.id, error = %e, "resume guard artifact write failed");
            }
            self.emit(
                &task.id,
                EventKind::WorkspaceResumeGuard,
                json!({"expected": resume.expected, "actual": resume.actual}),
            );
            self.transition(
                &task.id,
                TaskStatus::Running,
                TaskStatus::WaitingManual,
                Some(GateReason::WorkspaceResumeGuardMismatch),
            );
            self.emit(&task.id, EventKind::QueuedForManual, json!({"cause": "workspace_resume_guard_mismatch"}));
            return self.current(&task.id);
        }

        // Preflight risk gate.
        let findings = PreflightRiskGate::evaluate(&task);
        if let Err(e) = self.artifacts.write_json(
            &task.id,
            "artifacts/preflight_risk_gate.json",
            &findings,
        ) {
            warn!(task_id = %task.id, error = %e, "risk gate artifact write failed");
        }
        self.emit(
            &task.id,
            EventKind::PreflightRiskGate,
            json!({"findings": findings.len(), "passed": PreflightRiskGate::passes(&findings)}),
        );
        if !PreflightRiskGate::passes(&findings) {
            // Codes only; the full findings (with paths) live in the
            // preflight_risk_gate.json artifact.
            let codes: Vec<&str> = findings.iter().map(|f| f.code.as_str()).collect();
            return self.finish(
                &task.id,
                TaskStatus::FailedGate,
                Some(GateReason::PreflightRiskGateFailed),
                json!({"finding_codes": codes}),
            );
        }

        // Promotion preflight snapshot, compared against a fresh capture at
        // merge time. Persisted so promote-round can hold later write-backs
        // to the same head-SHA stability invariant.
        let merge_preflight = task
            .merge_target_path
            .as_deref()
            .map(|p| HeadSnapshot::capture(Path::new(p)));
        if let Some(snapshot) = &merge_preflight {
            if let Err(e) = self.artifacts.write_json(
                &task.id,
                "artifacts/promotion_preflight.json",
                snapshot,
            ) {
                warn!(task_id = %task.id, error = %e, "promotion preflight artifact write failed");
            }
        }

        // Sandbox allocation.
        let mut task = task;
        if task.options.sandbox_mode && task.sandbox_path.is_none() {
            match self.sandboxes.allocate(&task) {
                Ok(path) => {
                    task = self.repo.set_runtime(
                        &task.id,
                        RuntimeUpdate {
                            sandbox_path: Some(Some(path.display().to_string())),
                            sandbox_generated: Some(true),
                            ..Default::default()
                        },
                    )?;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "sandbox allocation failed");
                    return self.finish(
                        &task.id,
                        TaskStatus::FailedSystem,
                        Some(GateReason::SandboxAllocationFailed),
                        json!({"cause": "sandbox_allocation"}),
                    );
                }
            }
        }

        // Reviewer-gated workflow: consensus first, then manual hand-off.
        if !task.options.self_loop_mode && !task.author_approved {
            return self.run_consensus(&task, &cancel).await;
        }

        self.run_rounds(task, merge_preflight, &cancel).await
    }

    async fn admit(&self, task: &Task, cancel: &CancellationToken) -> Option<AdmissionPermit> {
        match self.admission.try_admit(&task.id) {
            AdmissionDecision::Admitted(permit) => Some(permit),
            AdmissionDecision::Deduped => {
                self.emit(&task.id, EventKind::StartDeduped, json!({"cause": "already_in_flight"}));
                None
            }
            AdmissionDecision::Deferred { in_use, capacity } => {
                self.emit(
                    &task.id,
                    EventKind::StartDeferred,
                    json!({"cause": "concurrency_limit", "in_use": in_use, "capacity": capacity}),
                );
                self.admission.admit_wait(&task.id, cancel).await
            }
        }
    }

    /// Apply provider-cooldown routing to the author. Returns the task to
    /// run with (possibly on a fallback provider), or `None` on cancel.
    async fn route_author(&self, task: Task, cancel: &CancellationToken) -> Option<Task> {
        loop {
            match self.admission.resolve_provider(
                &task.author.provider,
                task.options.fallback_provider.as_ref(),
            ) {
                ProviderRoute::Primary => return Some(task),
                ProviderRoute::Fallback(provider) => {
                    info!(task_id = %task.id, fallback = %provider, "author routed to fallback provider");
                    let mut task = task;
                    task.author.provider = provider;
                    return Some(task);
                }
                ProviderRoute::Hold { remaining } => {
                    self.emit(
                        &task.id,
                        EventKind::StartDeferred,
                        json!({"cause": "provider_cooldown", "remaining_secs": remaining.as_secs()}),
                    );
                    let backoff = self.admission.config().defer_backoff.min(remaining.max(Duration::from_millis(10)));
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn run_consensus(&self, task: &Task, cancel: &CancellationToken) -> StoreResult<Task> {
        let machine = ConsensusMachine::new(
            self.gateway.as_ref(),
            self.repo.as_ref(),
            &self.artifacts,
            self.config.consensus.clone(),
        );
        let outcome = machine.run(task, cancel).await;
        let reason = outcome.gate_reason();

        match outcome {
            ConsensusOutcome::Agreed { rounds } => {
                self.emit(
                    &task.id,
                    EventKind::AuthorConfirmationRequired,
                    json!({"consensus_rounds": rounds}),
                );
                self.transition(&task.id, TaskStatus::Running, TaskStatus::WaitingManual, Some(reason));
                self.emit(&task.id, EventKind::QueuedForManual, json!({"cause": reason}));
                self.current(&task.id)
            }
            ConsensusOutcome::StalledInRound { .. }
            | ConsensusOutcome::StalledAcrossRounds { .. } => {
                self.transition(&task.id, TaskStatus::Running, TaskStatus::WaitingManual, Some(reason));
                self.emit(&task.id, EventKind::QueuedForManual, json!({"cause": reason}));
                self.current(&task.id)
            }
            ConsensusOutcome::PrecheckUnavailable { ref class, .. }
            | ConsensusOutcome::ReviewUnavailable { ref class, .. } => {
                if class == "provider_limit" {
                    self.admission.record_provider_limit(&task.author.provider);
                }
                if class == "not_found" {
                    // Missing adapter binary is an environment fault.
                    self.finish(&task.id, TaskStatus::FailedSystem, Some(reason), json!({"class": class}))
                } else {
                    self.transition(&task.id, TaskStatus::Running, TaskStatus::WaitingManual, Some(reason));
                    self.emit(&task.id, EventKind::QueuedForManual, json!({"cause": reason}));
                    self.current(&task.id)
                }
            }
            ConsensusOutcome::DeadlineReached => self.finish(
                &task.id,
                TaskStatus::Canceled,
                Some(GateReason::DeadlineReached),
                json!({"at": Utc::now()}),
            ),
            ConsensusOutcome::Canceled => {
                self.emit(&task.id, EventKind::Canceled, json!({"cooperative": true}));
                self.finish(&task.id, TaskStatus::Canceled, None, json!({"cooperative": true}))
            }
        }
    }

    async fn run_rounds(
        &self,
        mut task: Task,
        merge_preflight: Option<HeadSnapshot>,
        cancel: &CancellationToken,
    ) -> StoreResult<Task> {
        let executor = RoundExecutor::new(
            self.gateway.as_ref(),
            self.repo.as_ref(),
            &self.artifacts,
            self.config.round.clone(),
        );
        let mut tracker = ProgressTracker::new(self.config.strategy_shift_limit);
        let mut prior_reason: Option<GateReason> = None;
        let deadline_configured = task.options.evolve_until.is_some();
        // Candidate mode: every configured round runs and leaves a
        // promotable snapshot; the task's own verdict is the final round's.
        let candidate_mode = task.options.max_rounds > 1 && !task.options.auto_merge;

        loop {
            let round = task.rounds_completed + 1;

            if deadline_passed(&task) {
                return self.finish(
                    &task.id,
                    TaskStatus::Canceled,
                    Some(GateReason::DeadlineReached),
                    json!({"round": round}),
                );
            }
            if !deadline_configured && round > task.options.max_rounds {
                if candidate_mode && prior_reason.is_none() {
                    // Final round passed; the candidate set is complete.
                    return self.complete_passed(task, merge_preflight).await;
                }
                let reason = prior_reason.unwrap_or(GateReason::VerificationFailed);
                return self.finish(
                    &task.id,
                    TaskStatus::FailedGate,
                    Some(reason),
                    json!({"rounds_completed": task.rounds_completed}),
                );
            }
            if cancel.is_cancelled() {
                self.emit(&task.id, EventKind::Canceled, json!({"cooperative": true}));
                return self.finish(&task.id, TaskStatus::Canceled, None, json!({"cooperative": true}));
            }

            let result = executor.run(&task, round, &mut tracker, prior_reason, cancel).await;
            task = self.repo.set_runtime(
                &task.id,
                RuntimeUpdate {
                    rounds_completed: Some(round),
                    ..Default::default()
                },
            )?;

            if result.system_failure {
                return self.finish(
                    &task.id,
                    TaskStatus::FailedSystem,
                    result.reason,
                    json!({"round": round, "detail": result.detail}),
                );
            }
            if result.passed {
                if candidate_mode && !deadline_configured && round < task.options.max_rounds {
                    // Keep producing candidates; a pass resets the reason seed.
                    prior_reason = None;
                    continue;
                }
                return self.complete_passed(task, merge_preflight).await;
            }
            if result.no_progress {
                return self.finish(
                    &task.id,
                    TaskStatus::FailedGate,
                    Some(GateReason::LoopNoProgress),
                    json!({"round": round, "shifts": tracker.shifts()}),
                );
            }
            if result.reason == Some(GateReason::ProviderLimit) {
                self.admission.record_provider_limit(&task.author.provider);
            }
            prior_reason = result.reason;
        }
    }

    /// Terminal success path: optional auto-merge pipeline, then `passed`.
    async fn complete_passed(
        &self,
        task: Task,
        merge_preflight: Option<HeadSnapshot>,
    ) -> StoreResult<Task> {
        if task.options.auto_merge {
            // "No evidence, no merge" — re-checked even though the round
            // just produced a bundle.
            let evidence = EvidenceGuard::recheck(&self.artifacts, &task.id, task.rounds_completed);
            if let crate::guards::EvidenceDecision::Fail { reason, detail } = evidence {
                return self.finish(
                    &task.id,
                    TaskStatus::FailedGate,
                    Some(reason),
                    json!({"detail": detail}),
                );
            }

            let target = task
                .merge_target_path
                .clone()
                .unwrap_or_else(|| task.workspace_path.clone());
            let preflight = merge_preflight.unwrap_or_else(|| HeadSnapshot::capture(Path::new(&target)));
            let decision =
                PromotionGuard::check(&task.options.promotion, &preflight, Path::new(&target));
            self.emit(
                &task.id,
                EventKind::PromotionGuardChecked,
                json!({"allowed": decision.allowed, "reason": decision.reason, "detail": decision.detail}),
            );
            if !decision.allowed {
                if decision.reason == Some(GateReason::HeadShaMismatch) {
                    self.emit(&task.id, EventKind::HeadShaMismatch, json!({"detail": decision.detail}));
                }
                return self.finish(
                    &task.id,
                    TaskStatus::FailedGate,
                    decision.reason,
                    json!({"detail": decision.detail}),
                );
            }

            if task.options.sandbox_mode {
                if let Some(sandbox) = &task.sandbox_path {
                    if let Err(e) =
                        copy_filtered_tree(&PathBuf::from(sandbox), &PathBuf::from(&target))
                    {
                        warn!(task_id = %task.id, error = %e, "merge write-back failed");
                        return self.finish(
                            &task.id,
                            TaskStatus::FailedSystem,
                            None,
                            json!({"cause": "merge_copy_failed"}),
                        );
                    }
                }
            }

            let summary = json!({
                "task_id": task.id,
                "round": task.rounds_completed,
                "target": target,
                "merged_at": Utc::now(),
                "head_before": preflight,
            });
            if let Err(e) =
                self.artifacts
                    .write_json(&task.id, "artifacts/auto_merge_summary.json", &summary)
            {
                warn!(task_id = %task.id, error = %e, "auto merge summary write failed");
            }
            let task = self.repo.set_runtime(
                &task.id,
                RuntimeUpdate {
                    auto_merge_completed: Some(true),
                    ..Default::default()
                },
            )?;
            self.emit(
                &task.id,
                EventKind::AutoMergeCompleted,
                json!({"summary": "artifacts/auto_merge_summary.json", "round": task.rounds_completed}),
            );

            let finished = self.finish(
                &task.id,
                TaskStatus::Passed,
                Some(GateReason::AutoMergeCompleted),
                json!({"rounds_completed": task.rounds_completed}),
            )?;
            if let Err(e) = self.sandboxes.cleanup(&finished) {
                warn!(task_id = %finished.id, error = %e, "sandbox cleanup failed");
            }
            Ok(finished)
        } else {
            self.finish(
                &task.id,
                TaskStatus::Passed,
                None,
                json!({"rounds_completed": task.rounds_completed}),
            )
        }
    }

    /// CAS into a terminal status, emit `terminated`, write the terminal
    /// reports, and record the project-history ledger entry.
    fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: Option<GateReason>,
        payload: serde_json::Value,
    ) -> StoreResult<Task> {
        let task = match self.transition(task_id, TaskStatus::Running, status, reason) {
            Some(task) => task,
            None => return self.current(task_id),
        };
        self.emit(
            task_id,
            EventKind::Terminated,
            json!({"status": status, "reason": reason, "detail": payload}),
        );
        self.write_reports(&task);
        let entry = ProjectHistoryEntry::from_task(
            &task,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            reason.map(|r| format!("investigate {}", r)).into_iter().collect(),
        );
        if let Err(e) = self.repo.record_history(entry) {
            warn!(task_id, error = %e, "history record failed");
        }
        Ok(task)
    }

    /// `summary.md` and `final_report.md` for the terminated task. Also
    /// called by the service for operator-driven terminal transitions
    /// (cancel, force-fail, author reject), which never pass through
    /// `finish`.
    pub(crate) fn write_reports(&self, task: &Task) {
        let reason = task
            .last_gate_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        let summary = format!(
            "# {title}\n\n- status: `{status}`\n- gate reason: `{reason}`\n- rounds completed: {rounds}\n",
            title = task.title,
            status = task.status,
            reason = reason,
            rounds = task.rounds_completed,
        );
        if let Err(e) = self.artifacts.write_artifact(&task.id, "summary.md", summary.as_bytes()) {
            warn!(task_id = %task.id, error = %e, "summary write failed");
        }

        let mut report = summary;
        report.push_str(&format!(
            "\n## Participants\n\n- author: `{}`\n",
            task.author
        ));
        for reviewer in &task.reviewers {
            report.push_str(&format!("- reviewer: `{}`\n", reviewer));
        }
        report.push_str("\n## Timeline\n\n");
        if let Ok(events) = self.repo.read_events(&task.id) {
            for event in events {
                report.push_str(&format!("- `{}` {}\n", event.seq, event.kind));
            }
        }
        if let Err(e) =
            self.artifacts
                .write_artifact(&task.id, "final_report.md", report.as_bytes())
        {
            warn!(task_id = %task.id, error = %e, "final report write failed");
        }
    }

    /// CAS helper that treats a lost race as "someone else terminated the
    /// task" and backs off.
    fn transition(
        &self,
        task_id: &str,
        expected: TaskStatus,
        new_status: TaskStatus,
        reason: Option<GateReason>,
    ) -> Option<Task> {
        match self.repo.update_status_if(task_id, expected, new_status, reason) {
            Ok(task) => Some(task),
            Err(StoreError::TransitionConflict { actual, .. }) => {
                info!(task_id, %actual, "transition lost race, standing down");
                None
            }
            Err(e) => {
                warn!(task_id, error = %e, "transition failed");
                None
            }
        }
    }

    fn current(&self, task_id: &str) -> StoreResult<Task> {
        self.repo
            .get_task(task_id)?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    fn emit(&self, task_id: &str, kind: EventKind, payload: serde_json::Value) {
        let event = TaskEvent::new(task_id, kind).with_payload(payload);
        if let Err(e) = self.repo.append_event(event) {
            warn!(task_id, kind = %kind, error = %e, "event append failed");
        }
    }
}

fn deadline_passed(task: &Task) -> bool {
    task.options
        .evolve_until
        .map(|deadline| Utc::now() >= deadline)
        .unwrap_or(false)
}

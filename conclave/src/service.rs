//! Orchestrator service — the public façade over the coordinator, stores,
//! and scheduler. Every mutation routes through the repository's
//! compare-and-set, so two concurrent decisions on the same task never both
//! succeed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admission::AdmissionScheduler;
use crate::coordinator::{CoordinatorConfig, TaskCoordinator};
use crate::gateway::ParticipantGateway;
use crate::guards::{workspace_fingerprint, EvidenceDecision, EvidenceGuard, HeadSnapshot, PromotionGuard};
use crate::history::ProjectHistoryEntry;
use crate::sandbox::{copy_filtered_tree, SandboxManager};
use crate::store::repository::RuntimeUpdate;
use crate::store::{ArtifactStore, SharedRepository, StoreError};
use crate::task::{
    AuthorDecision, AuthorVerdict, EventKind, GateReason, ParticipantId, Task, TaskEvent,
    TaskOptions, TaskStatus,
};

/// Errors surfaced to control-plane callers.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid task spec: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task is {actual}, operation requires {required}")]
    InvalidState {
        actual: TaskStatus,
        required: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Create-task input, as accepted by the REST surface.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub workspace_path: String,
    #[serde(default)]
    pub sandbox_path: Option<String>,
    #[serde(default)]
    pub merge_target_path: Option<String>,
    pub author: String,
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub options: TaskOptions,
}

/// Author decision input.
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionRequest {
    pub decision: AuthorVerdict,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
}

/// The orchestrator: one value owns the scheduler, the stores, and the
/// per-task cancellation tokens. No process-global state.
pub struct Orchestrator {
    repo: SharedRepository,
    artifacts: ArtifactStore,
    coordinator: Arc<TaskCoordinator>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn ParticipantGateway>,
        repo: SharedRepository,
        artifacts: ArtifactStore,
        sandboxes: SandboxManager,
        admission: AdmissionScheduler,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let coordinator = Arc::new(TaskCoordinator::new(
            gateway,
            Arc::clone(&repo),
            artifacts.clone(),
            sandboxes,
            admission,
            config,
        ));
        Arc::new(Self {
            repo,
            artifacts,
            coordinator,
            cancels: Mutex::new(HashMap::new()),
        })
    }

    pub fn repo(&self) -> &SharedRepository {
        &self.repo
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Validate and create a task in `queued`.
    pub fn create_task(&self, spec: TaskSpec) -> Result<Task, ServiceError> {
        if spec.title.trim().is_empty() {
            return Err(ServiceError::Validation("title must be non-empty".into()));
        }
        let author = ParticipantId::parse(&spec.author)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;
        if spec.reviewers.is_empty() {
            return Err(ServiceError::Validation(
                "at least one reviewer is required".into(),
            ));
        }
        let mut reviewers = Vec::with_capacity(spec.reviewers.len());
        for raw in &spec.reviewers {
            let id = ParticipantId::parse(raw)
                .map_err(|e| ServiceError::Validation(e.to_string()))?;
            if id == author || reviewers.contains(&id) {
                return Err(ServiceError::Validation(format!(
                    "duplicate participant id {}",
                    id
                )));
            }
            reviewers.push(id);
        }
        spec.options
            .validate()
            .map_err(ServiceError::Validation)?;
        for (name, command) in [
            ("test_command", &spec.options.test_command),
            ("lint_command", &spec.options.lint_command),
        ] {
            if let Some(cmd) = command {
                if cmd.split_whitespace().next().is_none() {
                    return Err(ServiceError::Validation(format!(
                        "{} must name an executable",
                        name
                    )));
                }
            }
        }
        if !Path::new(&spec.workspace_path).is_dir() {
            return Err(ServiceError::Validation(format!(
                "workspace path does not exist: {}",
                spec.workspace_path
            )));
        }

        let now = Utc::now();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            title: spec.title,
            description: spec.description,
            workspace_fingerprint: workspace_fingerprint(Path::new(&spec.workspace_path)),
            workspace_path: spec.workspace_path,
            sandbox_path: spec.sandbox_path,
            sandbox_generated: false,
            merge_target_path: spec.merge_target_path,
            author,
            reviewers,
            options: spec.options,
            status: TaskStatus::Queued,
            rounds_completed: 0,
            last_gate_reason: None,
            author_approved: false,
            revise_note: None,
            decision: None,
            auto_merge_completed: false,
            created_at: now,
            updated_at: now,
            terminated_at: None,
        };
        let task = self.repo.create_task(task)?;
        self.emit(&task.id, EventKind::Created, json!({"title": task.title}));
        info!(task_id = %task.id, "task created");
        Ok(task)
    }

    /// Start a task. Synchronous mode drives it to a resting status
    /// (terminal or `waiting_manual`); background mode returns immediately.
    pub async fn start_task(
        self: &Arc<Self>,
        task_id: &str,
        background: bool,
    ) -> Result<Task, ServiceError> {
        let task = self.get_task(task_id)?;
        let cancel = self.token_for(&task.id);

        if background {
            let this = Arc::clone(self);
            let id = task.id.clone();
            tokio::spawn(async move {
                if let Err(e) = this.coordinator.run_task(&id, cancel).await {
                    warn!(task_id = %id, error = %e, "background task run failed");
                }
            });
            Ok(task)
        } else {
            Ok(self.coordinator.run_task(&task.id, cancel).await?)
        }
    }

    /// Cooperative cancel: flips the task token and races the coordinator
    /// for the status transition.
    pub fn cancel_task(&self, task_id: &str) -> Result<Task, ServiceError> {
        let task = self.get_task(task_id)?;
        if let Some(token) = self.cancels.lock().unwrap_or_else(|e| e.into_inner()).get(&task.id) {
            token.cancel();
        }
        for from in [TaskStatus::Queued, TaskStatus::WaitingManual, TaskStatus::Running] {
            if task.status == from {
                match self.repo.update_status_if(task_id, from, TaskStatus::Canceled, None) {
                    Ok(task) => {
                        self.emit(task_id, EventKind::Canceled, json!({"operator": true}));
                        self.emit(
                            task_id,
                            EventKind::Terminated,
                            json!({"status": task.status, "reason": task.last_gate_reason}),
                        );
                        if let Err(e) = self.repo.record_history(ProjectHistoryEntry::from_task(
                            &task,
                            vec![],
                            vec![],
                            vec![],
                            vec![],
                        )) {
                            warn!(task_id, error = %e, "history record failed");
                        }
                        self.coordinator.write_reports(&task);
                        return Ok(task);
                    }
                    Err(StoreError::TransitionConflict { .. }) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        // Running coordinator (or a racer) owns the transition now.
        Ok(self.get_task(task_id)?)
    }

    /// Non-cooperative terminal failure. Idempotent on terminal tasks: the
    /// state is untouched and no second `force_failed` event is appended.
    pub fn force_fail(&self, task_id: &str, reason: &str) -> Result<Task, ServiceError> {
        let task = self.get_task(task_id)?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        if let Some(token) = self.cancels.lock().unwrap_or_else(|e| e.into_inner()).get(&task.id) {
            token.cancel();
        }
        // A queued task has nothing in flight; the graph only admits
        // cancellation from there.
        let terminal = if task.status == TaskStatus::Queued {
            TaskStatus::Canceled
        } else {
            TaskStatus::FailedSystem
        };
        match self.repo.update_status_if(
            task_id,
            task.status,
            terminal,
            Some(GateReason::ForceFailed),
        ) {
            Ok(task) => {
                self.emit(task_id, EventKind::ForceFailed, json!({"reason": reason}));
                self.emit(
                    task_id,
                    EventKind::Terminated,
                    json!({"status": task.status, "reason": GateReason::ForceFailed}),
                );
                if let Err(e) = self.repo.record_history(ProjectHistoryEntry::from_task(
                    &task,
                    vec![],
                    vec![format!("force-failed: {}", reason)],
                    vec![],
                    vec![],
                )) {
                    warn!(task_id, error = %e, "history record failed");
                }
                self.coordinator.write_reports(&task);
                Ok(task)
            }
            Err(StoreError::TransitionConflict { .. }) => {
                // Someone else terminated it first; idempotent no-op.
                Ok(self.get_task(task_id)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Author decision on a `waiting_manual` task.
    pub async fn submit_author_decision(
        self: &Arc<Self>,
        task_id: &str,
        request: DecisionRequest,
    ) -> Result<Task, ServiceError> {
        let task = self.get_task(task_id)?;
        if task.status != TaskStatus::WaitingManual {
            return Err(ServiceError::InvalidState {
                actual: task.status,
                required: "waiting_manual",
            });
        }

        let decision = AuthorDecision {
            verdict: request.decision,
            note: request.note.clone(),
            decided_at: Utc::now(),
        };

        let task = match request.decision {
            AuthorVerdict::Approve => {
                let task = self.repo.update_status_if(
                    task_id,
                    TaskStatus::WaitingManual,
                    TaskStatus::Queued,
                    Some(GateReason::AuthorApproved),
                )?;
                self.repo.set_runtime(
                    &task.id,
                    RuntimeUpdate {
                        author_approved: Some(true),
                        decision: Some(decision.clone()),
                        ..Default::default()
                    },
                )?
            }
            AuthorVerdict::Revise => {
                // Requeues without consuming a round; the note seeds the
                // next proposal.
                let task = self.repo.update_status_if(
                    task_id,
                    TaskStatus::WaitingManual,
                    TaskStatus::Queued,
                    Some(GateReason::AuthorFeedbackRequested),
                )?;
                self.repo.set_runtime(
                    &task.id,
                    RuntimeUpdate {
                        revise_note: Some(request.note.clone()),
                        decision: Some(decision.clone()),
                        ..Default::default()
                    },
                )?
            }
            AuthorVerdict::Reject => {
                let task = self.repo.update_status_if(
                    task_id,
                    TaskStatus::WaitingManual,
                    TaskStatus::Canceled,
                    Some(GateReason::AuthorRejected),
                )?;
                self.repo.set_runtime(
                    &task.id,
                    RuntimeUpdate {
                        decision: Some(decision.clone()),
                        ..Default::default()
                    },
                )?
            }
        };
        self.emit(
            task_id,
            EventKind::AuthorDecision,
            json!({"decision": decision.verdict, "note": decision.note}),
        );

        // Reject is a terminal transition; it gets the same event trail,
        // ledger entry, and reports as any other terminal edge.
        if request.decision == AuthorVerdict::Reject {
            self.emit(task_id, EventKind::Canceled, json!({"cause": "author_reject"}));
            self.emit(
                task_id,
                EventKind::Terminated,
                json!({"status": task.status, "reason": task.last_gate_reason}),
            );
            if let Err(e) = self.repo.record_history(ProjectHistoryEntry::from_task(
                &task,
                vec![],
                vec![],
                vec![decision
                    .note
                    .clone()
                    .unwrap_or_else(|| "author rejected".to_string())],
                vec![],
            )) {
                warn!(task_id, error = %e, "history record failed");
            }
            self.coordinator.write_reports(&task);
        }

        if request.auto_start && task.status == TaskStatus::Queued {
            return self.start_task(task_id, true).await;
        }
        Ok(task)
    }

    /// Promote one round's artifacts into a target path. Valid only for
    /// terminal multi-round candidate tasks; evidence and promotion guards
    /// both re-run.
    pub fn promote_round(
        &self,
        task_id: &str,
        round: u32,
        target_path: &str,
    ) -> Result<Task, ServiceError> {
        let task = self.get_task(task_id)?;
        if !task.status.is_terminal() {
            return Err(ServiceError::InvalidState {
                actual: task.status,
                required: "terminal",
            });
        }
        if task.options.max_rounds <= 1 || task.options.auto_merge {
            return Err(ServiceError::Validation(
                "promote-round requires max_rounds>1 and auto_merge=0".into(),
            ));
        }
        if round == 0 || round > task.rounds_completed {
            return Err(ServiceError::Validation(format!(
                "round {} was never executed",
                round
            )));
        }

        let target = Path::new(target_path);
        // Head-SHA stability is judged against the snapshot captured when
        // the task ran; an ad-hoc target gets its baseline here, before the
        // remaining checks spend any time.
        let preflight = self
            .stored_promotion_preflight(&task, target_path)
            .unwrap_or_else(|| HeadSnapshot::capture(target));

        if let EvidenceDecision::Fail { reason, detail } =
            EvidenceGuard::recheck(&self.artifacts, task_id, round)
        {
            return Err(ServiceError::Validation(format!("{}: {}", reason, detail)));
        }

        let snapshot_dir = self
            .artifacts
            .task_dir(task_id)
            .map_err(StoreError::from)?
            .join("artifacts/rounds")
            .join(format!("round-{:03}-snapshot", round));
        if !snapshot_dir.is_dir() {
            return Err(ServiceError::Validation(format!(
                "no snapshot for round {}",
                round
            )));
        }

        // Fresh capture of the target immediately before the write-back.
        let decision = PromotionGuard::check(&task.options.promotion, &preflight, target);
        self.emit(
            task_id,
            EventKind::PromotionGuardChecked,
            json!({"allowed": decision.allowed, "reason": decision.reason, "round": round}),
        );
        if !decision.allowed {
            return Err(ServiceError::Validation(format!(
                "{}: {}",
                decision
                    .reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "promotion denied".into()),
                decision.detail
            )));
        }

        copy_filtered_tree(&snapshot_dir, target).map_err(|e| {
            ServiceError::Validation(format!("snapshot copy failed: {}", e))
        })?;

        let summary = json!({
            "task_id": task_id,
            "round": round,
            "target": target_path,
            "promoted_at": Utc::now(),
        });
        if let Err(e) = self.artifacts.write_json(
            task_id,
            &format!("artifacts/round-{}-promote-summary.json", round),
            &summary,
        ) {
            warn!(task_id, error = %e, "promote summary write failed");
        }
        self.emit(
            task_id,
            EventKind::RoundPromoted,
            json!({
                "round": round,
                "summary": format!("artifacts/round-{}-promote-summary.json", round),
            }),
        );
        Ok(self.get_task(task_id)?)
    }

    /// Preflight snapshot the coordinator persisted when the task ran,
    /// usable only when the promotion targets the same path.
    fn stored_promotion_preflight(&self, task: &Task, target_path: &str) -> Option<HeadSnapshot> {
        if task.merge_target_path.as_deref() != Some(target_path) {
            return None;
        }
        let bytes = self
            .artifacts
            .read_artifact(&task.id, "artifacts/promotion_preflight.json")
            .ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Events from the repository, falling back to the artifact log when
    /// the repository no longer has the task.
    pub fn get_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, ServiceError> {
        match self.repo.read_events(task_id) {
            Ok(events) => Ok(events),
            Err(StoreError::NotFound(_)) => Ok(self
                .artifacts
                .read_events(task_id)
                .map_err(StoreError::from)?),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, ServiceError> {
        self.repo
            .get_task(task_id)?
            .ok_or_else(|| ServiceError::NotFound(task_id.to_string()))
    }

    pub fn list_tasks(&self, limit: usize) -> Result<Vec<Task>, ServiceError> {
        Ok(self.repo.list_tasks(limit)?)
    }

    pub fn query_history(
        &self,
        project: Option<&str>,
    ) -> Result<Vec<ProjectHistoryEntry>, ServiceError> {
        Ok(self.repo.query_history(project)?)
    }

    pub fn clear_history(&self, project: Option<&str>) -> Result<usize, ServiceError> {
        Ok(self.repo.clear_history(project)?)
    }

    fn token_for(&self, task_id: &str) -> CancellationToken {
        let mut map = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(task_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn emit(&self, task_id: &str, kind: EventKind, payload: serde_json::Value) {
        let event = TaskEvent::new(task_id, kind).with_payload(payload);
        if let Err(e) = self.repo.append_event(event) {
            warn!(task_id, kind = %kind, error = %e, "event append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::coordinator::CoordinatorConfig;
    use crate::gateway::Phase;
    use crate::store::{MemoryRepository, TaskRepository};
    use crate::testutil::ScriptedGateway;

    struct Rig {
        orchestrator: Arc<Orchestrator>,
        gateway: Arc<ScriptedGateway>,
        workspace: tempfile::TempDir,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("lib.rs"), "pub fn f() {}").unwrap();

        let artifacts = ArtifactStore::new(dir.path().join(".agents"));
        let repo: SharedRepository = Arc::new(MemoryRepository::new(artifacts.clone()));
        let gateway = Arc::new(ScriptedGateway::new());
        let orchestrator = Orchestrator::new(
            gateway.clone(),
            repo,
            artifacts,
            SandboxManager::new(dir.path().join("lab")),
            AdmissionScheduler::new(AdmissionConfig::default()),
            CoordinatorConfig::default(),
        );
        Rig {
            orchestrator,
            gateway,
            workspace,
            _dir: dir,
        }
    }

    fn spec(rig: &Rig) -> TaskSpec {
        TaskSpec {
            title: "fix flaky test".to_string(),
            description: String::new(),
            workspace_path: rig.workspace.path().display().to_string(),
            sandbox_path: None,
            merge_target_path: None,
            author: "claude#author".to_string(),
            reviewers: vec!["codex#rev".to_string()],
            options: TaskOptions {
                sandbox_mode: false,
                debate_mode: false,
                self_loop_mode: true,
                max_rounds: 1,
                test_command: Some("echo ok target/test.log".to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_create_validates_participants() {
        let rig = rig();
        let mut bad = spec(&rig);
        bad.reviewers = vec!["claude#author".to_string()];
        assert!(matches!(
            rig.orchestrator.create_task(bad),
            Err(ServiceError::Validation(_))
        ));

        let mut dup = spec(&rig);
        dup.reviewers = vec!["codex#rev".to_string(), "codex#rev".to_string()];
        assert!(matches!(
            rig.orchestrator.create_task(dup),
            Err(ServiceError::Validation(_))
        ));

        let mut no_sep = spec(&rig);
        no_sep.author = "claude".to_string();
        assert!(matches!(
            rig.orchestrator.create_task(no_sep),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn test_create_captures_fingerprint_and_emits_event() {
        let rig = rig();
        let task = rig.orchestrator.create_task(spec(&rig)).unwrap();
        assert!(!task.workspace_fingerprint.is_empty());

        let events = rig.orchestrator.get_events(&task.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Created);
        assert_eq!(events[0].seq, 1);
    }

    #[tokio::test]
    async fn test_force_fail_idempotent_on_terminal() {
        let rig = rig();
        let task = rig.orchestrator.create_task(spec(&rig)).unwrap();

        // Queued tasks collapse to canceled; the reason still records the
        // operator action.
        let failed = rig.orchestrator.force_fail(&task.id, "op").unwrap();
        assert_eq!(failed.status, TaskStatus::Canceled);
        assert_eq!(failed.last_gate_reason, Some(GateReason::ForceFailed));

        // Second call: same state, no second force_failed event.
        let again = rig.orchestrator.force_fail(&task.id, "op-again").unwrap();
        assert_eq!(again.status, TaskStatus::Canceled);
        let events = rig.orchestrator.get_events(&task.id).unwrap();
        let force_events = events
            .iter()
            .filter(|e| e.kind == EventKind::ForceFailed)
            .count();
        assert_eq!(force_events, 1);
    }

    #[tokio::test]
    async fn test_decision_requires_waiting_manual() {
        let rig = rig();
        let task = rig.orchestrator.create_task(spec(&rig)).unwrap();
        let err = rig
            .orchestrator
            .submit_author_decision(
                &task.id,
                DecisionRequest {
                    decision: AuthorVerdict::Approve,
                    note: None,
                    auto_start: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let rig = rig();
        let task = rig.orchestrator.create_task(spec(&rig)).unwrap();
        let canceled = rig.orchestrator.cancel_task(&task.id).unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sync_start_runs_to_terminal() {
        let rig = rig();
        let task = rig.orchestrator.create_task(spec(&rig)).unwrap();

        rig.gateway
            .script("claude#author", Phase::Discussion, vec![ScriptedGateway::ok("plan")]);
        rig.gateway.script(
            "claude#author",
            Phase::Implementation,
            vec![ScriptedGateway::ok("changed src/lib.rs; log target/test.log")],
        );
        rig.gateway.script(
            "codex#rev",
            Phase::Review,
            vec![ScriptedGateway::ok(r#"{"verdict": "no_blocker", "issues": [], "reason": ""}"#)],
        );

        let finished = rig.orchestrator.start_task(&task.id, false).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Passed);
    }

    #[tokio::test]
    async fn test_get_events_falls_back_to_artifacts() {
        let rig = rig();
        let task = rig.orchestrator.create_task(spec(&rig)).unwrap();
        // Repository loses the row; the artifact log still answers.
        rig.orchestrator.repo().delete_task(&task.id).unwrap();

        let events = rig.orchestrator.get_events(&task.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Created);
    }

    #[tokio::test]
    async fn test_promote_round_requires_candidate_mode() {
        let rig = rig();
        let mut s = spec(&rig);
        s.options.max_rounds = 1;
        let task = rig.orchestrator.create_task(s).unwrap();
        rig.orchestrator.force_fail(&task.id, "end it").unwrap();

        let err = rig
            .orchestrator
            .promote_round(&task.id, 1, rig.workspace.path().to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}

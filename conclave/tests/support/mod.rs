//! Shared rig for integration scenarios: a scripted participant gateway
//! wired into a full orchestrator over temp directories.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use conclave::coordinator::CoordinatorConfig;
use conclave::gateway::{InvokeOutcome, InvokeRequest, ParticipantGateway, Phase};
use conclave::{
    AdmissionConfig, AdmissionScheduler, ArtifactStore, MemoryRepository, Orchestrator,
    SandboxManager, SharedRepository, TaskOptions, TaskSpec, TaskStatus,
};

/// Behavior scripted for one `(participant, phase)` pair.
pub enum Script {
    /// Sequence of canned outcomes; the last entry repeats.
    Outcomes(Vec<InvokeOutcome>),
    /// Block until the task is canceled, then report a timeout.
    Hang,
}

/// Deterministic gateway for scenario tests. Unscripted calls behave like
/// a missing executable.
pub struct ScriptedGateway {
    scripts: Mutex<HashMap<(String, Phase), Script>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self, participant: &str, phase: Phase, outcomes: Vec<InvokeOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert((participant.to_string(), phase), Script::Outcomes(outcomes));
    }

    pub fn hang(&self, participant: &str, phase: Phase) {
        self.scripts
            .lock()
            .unwrap()
            .insert((participant.to_string(), phase), Script::Hang);
    }

    pub fn ok(text: &str) -> InvokeOutcome {
        InvokeOutcome::Ok {
            text: text.to_string(),
            stream_events: vec![],
        }
    }
}

#[async_trait]
impl ParticipantGateway for ScriptedGateway {
    async fn invoke(&self, request: InvokeRequest, cancel: &CancellationToken) -> InvokeOutcome {
        let key = (request.participant.to_string(), request.phase);
        let hang = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&key) {
                Some(Script::Hang) => true,
                Some(Script::Outcomes(outcomes)) if outcomes.len() > 1 => {
                    return outcomes.remove(0);
                }
                Some(Script::Outcomes(outcomes)) => {
                    return outcomes.first().cloned().unwrap_or(InvokeOutcome::NotFound);
                }
                None => return InvokeOutcome::NotFound,
            }
        };
        if hang {
            cancel.cancelled().await;
            return InvokeOutcome::Timeout { after_secs: 0 };
        }
        InvokeOutcome::NotFound
    }
}

/// Full orchestrator over temp dirs with a scripted gateway.
pub struct Rig {
    pub orchestrator: Arc<Orchestrator>,
    pub gateway: Arc<ScriptedGateway>,
    pub workspace: tempfile::TempDir,
    pub merge_target: tempfile::TempDir,
    pub artifacts: ArtifactStore,
    _dir: tempfile::TempDir,
}

pub fn rig() -> Rig {
    rig_with_capacity(1)
}

pub fn rig_with_capacity(capacity: usize) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(workspace.path().join("src")).unwrap();
    std::fs::write(workspace.path().join("src/lib.rs"), "pub fn run() {}").unwrap();
    let merge_target = tempfile::tempdir().unwrap();

    let artifacts = ArtifactStore::new(dir.path().join(".agents"));
    let repo: SharedRepository = Arc::new(MemoryRepository::new(artifacts.clone()));
    let gateway = Arc::new(ScriptedGateway::new());
    let orchestrator = Orchestrator::new(
        gateway.clone(),
        repo,
        artifacts.clone(),
        SandboxManager::new(dir.path().join("lab")),
        AdmissionScheduler::new(AdmissionConfig {
            capacity,
            provider_cooldown: Duration::from_secs(60),
            defer_backoff: Duration::from_millis(20),
        }),
        CoordinatorConfig::default(),
    );
    Rig {
        orchestrator,
        gateway,
        workspace,
        merge_target,
        artifacts,
        _dir: dir,
    }
}

/// Base spec: author claude#a, reviewer codex#b, real workspace.
pub fn base_spec(rig: &Rig) -> TaskSpec {
    TaskSpec {
        title: "harden the retry loop".to_string(),
        description: "Fix the flaky retry behavior under load".to_string(),
        workspace_path: rig.workspace.path().display().to_string(),
        sandbox_path: None,
        merge_target_path: None,
        author: "claude#a".to_string(),
        reviewers: vec!["codex#b".to_string()],
        options: TaskOptions {
            sandbox_mode: false,
            debate_mode: false,
            self_loop_mode: true,
            max_rounds: 1,
            test_command: Some("echo test run logged in target/test.log".to_string()),
            ..Default::default()
        },
    }
}

/// Poll a background task until it leaves active states.
pub async fn wait_for_rest(rig: &Rig, task_id: &str) -> TaskStatus {
    for _ in 0..200 {
        let task = rig.orchestrator.get_task(task_id).unwrap();
        if task.status.is_terminal() || task.status == TaskStatus::WaitingManual {
            return task.status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {} never settled", task_id);
}

pub const NO_BLOCKER: &str = r#"{"verdict": "no_blocker", "issues": [], "reason": "clean"}"#;
pub const BLOCKER_001: &str = r#"{"verdict": "blocker", "issues": [{"issue_id": "ISSUE-001", "detail": "missing error handling"}], "reason": "needs work"}"#;
pub const PROPOSAL_PLAIN: &str = r#"{"summary": "tighten retry backoff and add tests", "issue_responses": []}"#;
pub const PROPOSAL_COVERING_001: &str = r#"{"summary": "address the raised issue", "issue_responses": [{"issue_id": "ISSUE-001", "action": "accept"}]}"#;
pub const IMPL_WITH_PATHS: &str =
    "Reworked src/retry.rs and added tests/retry_test.rs; verification output lands in target/test.log";

//! Shared unit-test scaffolding: a scripted gateway and task fixtures.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::gateway::{InvokeOutcome, InvokeRequest, ParticipantGateway, Phase};
use crate::store::{ArtifactStore, MemoryRepository};
use crate::task::Task;

/// Gateway scripted per participant-and-phase with a sequence of canned
/// outcomes; repeats the last entry once the sequence is exhausted.
/// Unscripted calls behave like a missing executable.
pub struct ScriptedGateway {
    scripts: Mutex<HashMap<(String, Phase), Vec<InvokeOutcome>>>,
    invocations: Mutex<Vec<(String, Phase)>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, participant: &str, phase: Phase, outcomes: Vec<InvokeOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert((participant.to_string(), phase), outcomes);
    }

    pub fn ok(text: &str) -> InvokeOutcome {
        InvokeOutcome::Ok {
            text: text.to_string(),
            stream_events: vec![],
        }
    }

    /// Recorded `(participant, phase)` pairs, in invocation order.
    pub fn invocations(&self) -> Vec<(String, Phase)> {
        self.invocations.lock().unwrap().clone()
    }
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ParticipantGateway for ScriptedGateway {
    async fn invoke(&self, request: InvokeRequest, _cancel: &CancellationToken) -> InvokeOutcome {
        let key = (request.participant.to_string(), request.phase);
        self.invocations.lock().unwrap().push(key.clone());
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&key) {
            Some(outcomes) if outcomes.len() > 1 => outcomes.remove(0),
            Some(outcomes) => outcomes.first().cloned().unwrap_or(InvokeOutcome::NotFound),
            None => InvokeOutcome::NotFound,
        }
    }
}

/// Fresh repository + artifact store over a temp dir.
pub fn fixture() -> (MemoryRepository, ArtifactStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = ArtifactStore::new(dir.path().join(".agents"));
    let repo = MemoryRepository::new(artifacts.clone());
    (repo, artifacts, dir)
}

/// A task whose workspace is a real temp directory.
pub fn task_with_workspace() -> (Task, tempfile::TempDir) {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("lib.rs"), "pub fn run() {}").unwrap();
    let mut task = crate::task::types::tests::test_task();
    task.workspace_path = workspace.path().display().to_string();
    task.workspace_fingerprint =
        crate::guards::workspace_fingerprint(workspace.path());
    (task, workspace)
}

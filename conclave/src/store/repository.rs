//! Task repository — records, linearized status transitions, and per-task
//! event sequencing.
//!
//! The embedded default is [`MemoryRepository`]: task records and counters
//! live behind one mutex (so readers always observe a consistent
//! `(status, last_gate_reason, rounds_completed)` triple) and every write is
//! mirrored through the [`ArtifactStore`] before it becomes visible, which
//! makes the repository durable across restarts without an external
//! database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::artifacts::{ArtifactError, ArtifactStore};
use crate::history::ProjectHistoryEntry;
use crate::task::{AuthorDecision, GateReason, Task, TaskEvent, TaskStatus};

/// Error type for repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task already exists: {0}")]
    Duplicate(String),

    #[error("status is {actual}, expected {expected}")]
    TransitionConflict {
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("transition {from} → {to} is not in the status graph")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("artifact store error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("lock poisoned")]
    LockPoisoned,
}

/// Result type for repository operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a repository.
pub type SharedRepository = Arc<dyn TaskRepository>;

/// Mutable runtime fields settable outside the status CAS. Status and
/// `last_gate_reason` can only change through `update_status_if`.
#[derive(Debug, Default, Clone)]
pub struct RuntimeUpdate {
    pub rounds_completed: Option<u32>,
    pub sandbox_path: Option<Option<String>>,
    pub sandbox_generated: Option<bool>,
    pub author_approved: Option<bool>,
    pub revise_note: Option<Option<String>>,
    pub decision: Option<AuthorDecision>,
    pub auto_merge_completed: Option<bool>,
}

/// Storage abstraction the core depends on.
pub trait TaskRepository: Send + Sync {
    fn create_task(&self, task: Task) -> StoreResult<Task>;

    fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>>;

    /// Most recent first.
    fn list_tasks(&self, limit: usize) -> StoreResult<Vec<Task>>;

    /// Atomic compare-and-set transition. Fails with `TransitionConflict`
    /// when the current status is not `expected`, and `InvalidTransition`
    /// when the edge is outside the status graph. Returns the updated task.
    fn update_status_if(
        &self,
        task_id: &str,
        expected: TaskStatus,
        new_status: TaskStatus,
        reason: Option<GateReason>,
    ) -> StoreResult<Task>;

    /// Patch runtime fields without touching status.
    fn set_runtime(&self, task_id: &str, update: RuntimeUpdate) -> StoreResult<Task>;

    /// Allocate the next per-task sequence number and append the event,
    /// durably, returning it with `seq` filled in.
    fn append_event(&self, event: TaskEvent) -> StoreResult<TaskEvent>;

    fn read_events(&self, task_id: &str) -> StoreResult<Vec<TaskEvent>>;

    /// Delete a task record; the seq counter is cleared before the task row.
    fn delete_task(&self, task_id: &str) -> StoreResult<()>;

    fn record_history(&self, entry: ProjectHistoryEntry) -> StoreResult<()>;

    /// Ledger entries, optionally filtered by project slug.
    fn query_history(&self, project: Option<&str>) -> StoreResult<Vec<ProjectHistoryEntry>>;

    /// Remove ledger entries, optionally scoped to one project. Returns the
    /// number removed.
    fn clear_history(&self, project: Option<&str>) -> StoreResult<usize>;
}

struct Inner {
    tasks: HashMap<String, Task>,
    /// Dedicated per-task counter rows; cleared before the task row on
    /// delete to preserve referential integrity.
    seq_counters: HashMap<String, u64>,
    events: HashMap<String, Vec<TaskEvent>>,
    history: Vec<ProjectHistoryEntry>,
}

/// Embedded repository default.
pub struct MemoryRepository {
    inner: Mutex<Inner>,
    artifacts: ArtifactStore,
}

impl MemoryRepository {
    /// Open against an artifact root, reloading any persisted task
    /// snapshots and rebuilding seq counters from the event logs.
    pub fn open(artifacts: ArtifactStore) -> StoreResult<Self> {
        let mut tasks = HashMap::new();
        let mut seq_counters = HashMap::new();
        let mut events = HashMap::new();

        for task in artifacts.load_states()? {
            let log = artifacts.read_events(&task.id)?;
            let last_seq = log.last().map(|e| e.seq).unwrap_or(0);
            seq_counters.insert(task.id.clone(), last_seq);
            events.insert(task.id.clone(), log);
            tasks.insert(task.id.clone(), task);
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                tasks,
                seq_counters,
                events,
                history: Vec::new(),
            }),
            artifacts,
        })
    }

    /// Fresh repository over a new artifact root.
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                seq_counters: HashMap::new(),
                events: HashMap::new(),
                history: Vec::new(),
            }),
            artifacts,
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl TaskRepository for MemoryRepository {
    fn create_task(&self, task: Task) -> StoreResult<Task> {
        let mut inner = self.lock()?;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id));
        }
        self.artifacts.write_state(&task)?;
        inner.seq_counters.insert(task.id.clone(), 0);
        inner.events.insert(task.id.clone(), Vec::new());
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        Ok(self.lock()?.tasks.get(task_id).cloned())
    }

    fn list_tasks(&self, limit: usize) -> StoreResult<Vec<Task>> {
        let inner = self.lock()?;
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn update_status_if(
        &self,
        task_id: &str,
        expected: TaskStatus,
        new_status: TaskStatus,
        reason: Option<GateReason>,
    ) -> StoreResult<Task> {
        let mut inner = self.lock()?;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

        if task.status != expected {
            return Err(StoreError::TransitionConflict {
                expected,
                actual: task.status,
            });
        }
        if !task.status.can_transition_to(new_status) {
            return Err(StoreError::InvalidTransition {
                from: task.status,
                to: new_status,
            });
        }

        task.status = new_status;
        if let Some(reason) = reason {
            task.last_gate_reason = Some(reason);
        }
        task.updated_at = Utc::now();
        if new_status.is_terminal() {
            task.terminated_at = Some(task.updated_at);
        }
        let snapshot = task.clone();
        self.artifacts.write_state(&snapshot)?;
        Ok(snapshot)
    }

    fn set_runtime(&self, task_id: &str, update: RuntimeUpdate) -> StoreResult<Task> {
        let mut inner = self.lock()?;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

        if let Some(rounds) = update.rounds_completed {
            task.rounds_completed = rounds;
        }
        if let Some(sandbox) = update.sandbox_path {
            task.sandbox_path = sandbox;
        }
        if let Some(generated) = update.sandbox_generated {
            task.sandbox_generated = generated;
        }
        if let Some(approved) = update.author_approved {
            task.author_approved = approved;
        }
        if let Some(note) = update.revise_note {
            task.revise_note = note;
        }
        if let Some(decision) = update.decision {
            task.decision = Some(decision);
        }
        if let Some(merged) = update.auto_merge_completed {
            task.auto_merge_completed = merged;
        }
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        self.artifacts.write_state(&snapshot)?;
        Ok(snapshot)
    }

    fn append_event(&self, mut event: TaskEvent) -> StoreResult<TaskEvent> {
        let mut inner = self.lock()?;
        let counter = inner
            .seq_counters
            .get_mut(&event.task_id)
            .ok_or_else(|| StoreError::NotFound(event.task_id.clone()))?;
        *counter += 1;
        event.seq = *counter;

        // Durable before the event becomes visible to readers.
        self.artifacts.append_event(&event)?;
        inner
            .events
            .entry(event.task_id.clone())
            .or_default()
            .push(event.clone());
        Ok(event)
    }

    fn read_events(&self, task_id: &str) -> StoreResult<Vec<TaskEvent>> {
        let inner = self.lock()?;
        match inner.events.get(task_id) {
            Some(events) => Ok(events.clone()),
            None => Err(StoreError::NotFound(task_id.to_string())),
        }
    }

    fn delete_task(&self, task_id: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if !inner.tasks.contains_key(task_id) {
            return Err(StoreError::NotFound(task_id.to_string()));
        }
        // Counter row first, then the task row.
        inner.seq_counters.remove(task_id);
        inner.events.remove(task_id);
        inner.tasks.remove(task_id);
        Ok(())
    }

    fn record_history(&self, entry: ProjectHistoryEntry) -> StoreResult<()> {
        self.lock()?.history.push(entry);
        Ok(())
    }

    fn query_history(&self, project: Option<&str>) -> StoreResult<Vec<ProjectHistoryEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .history
            .iter()
            .filter(|e| project.map(|p| e.project == p).unwrap_or(true))
            .cloned()
            .collect())
    }

    fn clear_history(&self, project: Option<&str>) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let before = inner.history.len();
        match project {
            Some(p) => inner.history.retain(|e| e.project != p),
            None => inner.history.clear(),
        }
        Ok(before - inner.history.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{EventKind, TaskEvent};

    fn test_repo() -> (MemoryRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join(".agents"));
        (MemoryRepository::new(store), dir)
    }

    fn seeded_task(id: &str) -> Task {
        let mut task = crate::task::types::tests::test_task();
        task.id = id.to_string();
        task
    }

    #[test]
    fn test_create_and_get() {
        let (repo, _dir) = test_repo();
        repo.create_task(seeded_task("t-1")).unwrap();
        let got = repo.get_task("t-1").unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Queued);

        assert!(matches!(
            repo.create_task(seeded_task("t-1")),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn test_cas_rejects_wrong_predecessor() {
        let (repo, _dir) = test_repo();
        repo.create_task(seeded_task("t-1")).unwrap();

        // queued → running is fine.
        repo.update_status_if("t-1", TaskStatus::Queued, TaskStatus::Running, None)
            .unwrap();

        // A second writer still expecting queued loses the race.
        let err = repo
            .update_status_if("t-1", TaskStatus::Queued, TaskStatus::Canceled, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::TransitionConflict { .. }));
    }

    #[test]
    fn test_cas_rejects_edges_outside_graph() {
        let (repo, _dir) = test_repo();
        repo.create_task(seeded_task("t-1")).unwrap();
        let err = repo
            .update_status_if("t-1", TaskStatus::Queued, TaskStatus::Passed, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_terminal_sets_terminated_at_and_reason() {
        let (repo, _dir) = test_repo();
        repo.create_task(seeded_task("t-1")).unwrap();
        repo.update_status_if("t-1", TaskStatus::Queued, TaskStatus::Running, None)
            .unwrap();
        let task = repo
            .update_status_if(
                "t-1",
                TaskStatus::Running,
                TaskStatus::FailedGate,
                Some(GateReason::VerificationFailed),
            )
            .unwrap();
        assert!(task.terminated_at.is_some());
        assert_eq!(task.last_gate_reason, Some(GateReason::VerificationFailed));
    }

    #[test]
    fn test_event_seq_contiguous() {
        let (repo, _dir) = test_repo();
        repo.create_task(seeded_task("t-1")).unwrap();

        for _ in 0..5 {
            repo.append_event(TaskEvent::new("t-1", EventKind::Started))
                .unwrap();
        }
        let events = repo.read_events("t-1").unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_append_event_unknown_task() {
        let (repo, _dir) = test_repo();
        assert!(matches!(
            repo.append_event(TaskEvent::new("ghost", EventKind::Created)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_task_clears_counter() {
        let (repo, _dir) = test_repo();
        repo.create_task(seeded_task("t-1")).unwrap();
        repo.append_event(TaskEvent::new("t-1", EventKind::Created))
            .unwrap();
        repo.delete_task("t-1").unwrap();

        assert!(repo.get_task("t-1").unwrap().is_none());
        assert!(matches!(
            repo.append_event(TaskEvent::new("t-1", EventKind::Started)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_reopen_restores_tasks_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(".agents");
        {
            let repo = MemoryRepository::new(ArtifactStore::new(&root));
            repo.create_task(seeded_task("t-1")).unwrap();
            repo.append_event(TaskEvent::new("t-1", EventKind::Created))
                .unwrap();
            repo.append_event(TaskEvent::new("t-1", EventKind::Started))
                .unwrap();
        }

        let repo = MemoryRepository::open(ArtifactStore::new(&root)).unwrap();
        assert!(repo.get_task("t-1").unwrap().is_some());
        // Counter resumes after the highest persisted seq.
        let event = repo
            .append_event(TaskEvent::new("t-1", EventKind::GateDecision))
            .unwrap();
        assert_eq!(event.seq, 3);
    }

    #[test]
    fn test_history_scoped_clear() {
        let (repo, _dir) = test_repo();
        let mut a = crate::task::types::tests::test_task();
        a.workspace_path = "/p/alpha".to_string();
        let mut b = crate::task::types::tests::test_task();
        b.workspace_path = "/p/beta".to_string();

        repo.record_history(ProjectHistoryEntry::from_task(&a, vec![], vec![], vec![], vec![]))
            .unwrap();
        repo.record_history(ProjectHistoryEntry::from_task(&b, vec![], vec![], vec![], vec![]))
            .unwrap();

        assert_eq!(repo.query_history(None).unwrap().len(), 2);
        assert_eq!(repo.query_history(Some("alpha")).unwrap().len(), 1);
        assert_eq!(repo.clear_history(Some("alpha")).unwrap(), 1);
        assert_eq!(repo.query_history(None).unwrap().len(), 1);
    }
}

//! Artifact store — per-task append-only event log plus named artifacts.
//!
//! Layout: `<root>/threads/<task_id>/{events.jsonl, state.json, <artifacts...>}`.
//! Every relative path is validated against the task's artifact root before
//! any filesystem operation; `..`, absolute prefixes, and empty components
//! are rejected. `append_event` flushes before returning so the log survives
//! a crash of the process.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Component, Path, PathBuf};

use crate::task::{Task, TaskEvent};

/// Error type for artifact operations.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid artifact path {0:?}: escapes the task artifact root")]
    PathEscapes(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, ArtifactError>;

fn io_err(path: &Path, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Filesystem-backed artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one task's log and artifacts.
    pub fn task_dir(&self, task_id: &str) -> Result<PathBuf> {
        // Task ids are path components too, so they get the same screening.
        validate_rel_path(task_id)?;
        Ok(self.root.join("threads").join(task_id))
    }

    /// Resolve `rel_path` inside the task directory, rejecting escapes.
    fn resolve(&self, task_id: &str, rel_path: &str) -> Result<PathBuf> {
        validate_rel_path(rel_path)?;
        Ok(self.task_dir(task_id)?.join(rel_path))
    }

    /// Append one event to `events.jsonl`, durable before return.
    pub fn append_event(&self, event: &TaskEvent) -> Result<()> {
        let dir = self.task_dir(&event.task_id)?;
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = dir.join("events.jsonl");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        file.write_all(&line).map_err(|e| io_err(&path, e))?;
        file.sync_data().map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Read the full event log back. This is the observability fallback when
    /// the repository has lost the task row.
    pub fn read_events(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        let path = self.task_dir(task_id)?.join("events.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|e| io_err(&path, e))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| io_err(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    /// Write a named artifact under the task directory.
    pub fn write_artifact(&self, task_id: &str, rel_path: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(task_id, rel_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        fs::write(&path, bytes).map_err(|e| io_err(&path, e))
    }

    /// Serialize a value as pretty JSON into an artifact.
    pub fn write_json<T: serde::Serialize>(
        &self,
        task_id: &str,
        rel_path: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_artifact(task_id, rel_path, &bytes)
    }

    pub fn read_artifact(&self, task_id: &str, rel_path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(task_id, rel_path)?;
        fs::read(&path).map_err(|e| io_err(&path, e))
    }

    pub fn artifact_exists(&self, task_id: &str, rel_path: &str) -> bool {
        self.resolve(task_id, rel_path)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Snapshot the task record as `state.json`, making tasks durable across
    /// restarts without an external database.
    pub fn write_state(&self, task: &Task) -> Result<()> {
        self.write_json(&task.id, "state.json", task)
    }

    /// Load every persisted task snapshot under the root.
    pub fn load_states(&self) -> Result<Vec<Task>> {
        let threads = self.root.join("threads");
        if !threads.exists() {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();
        let entries = fs::read_dir(&threads).map_err(|e| io_err(&threads, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&threads, e))?;
            let state = entry.path().join("state.json");
            if !state.is_file() {
                continue;
            }
            let bytes = fs::read(&state).map_err(|e| io_err(&state, e))?;
            match serde_json::from_slice::<Task>(&bytes) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!(path = %state.display(), error = %e, "skipping unreadable task snapshot");
                }
            }
        }
        Ok(tasks)
    }
}

/// Reject any relative path that could resolve outside the task root.
fn validate_rel_path(rel_path: &str) -> Result<()> {
    if rel_path.is_empty() {
        return Err(ArtifactError::PathEscapes(rel_path.to_string()));
    }
    let path = Path::new(rel_path);
    if path.is_absolute() {
        return Err(ArtifactError::PathEscapes(rel_path.to_string()));
    }
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                // Windows-style separators are not split by `components` on
                // Unix; screen them out explicitly.
                let part = part.to_string_lossy();
                if part.contains('\\') || part.contains(':') {
                    return Err(ArtifactError::PathEscapes(rel_path.to_string()));
                }
            }
            Component::CurDir => {}
            _ => return Err(ArtifactError::PathEscapes(rel_path.to_string())),
        }
    }
    Ok(())
}

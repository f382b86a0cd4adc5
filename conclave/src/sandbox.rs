//! Sandbox manager — per-task filtered copies of the target workspace.
//!
//! A sandbox is a copy of the workspace with `.git`, virtualenv/cache
//! directories, and secret-looking files left out. Rounds execute inside
//! the sandbox; only the promotion pipeline writes back to the target.
//! Generated sandboxes are deleted after a task passes and its auto-merge
//! completes; user-supplied sandbox paths are never deleted.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use ignore::WalkBuilder;
use tracing::{debug, info, warn};

use crate::task::Task;

/// Directory names never copied into a sandbox.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".venv",
    "venv",
    "node_modules",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".tox",
    ".cache",
];

/// File name patterns treated as secrets.
fn is_secret_file(name: &str) -> bool {
    name.starts_with(".env")
        || name.ends_with(".pem")
        || name.ends_with(".key")
        || name.ends_with(".p12")
        || name.ends_with(".pfx")
        || name.starts_with("id_rsa")
        || name.starts_with("id_ed25519")
        || name == "credentials.json"
}

/// Error type for sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("workspace does not exist: {0}")]
    MissingWorkspace(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> SandboxError {
    SandboxError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Allocates and cleans up sandboxes under a configured base directory.
#[derive(Debug, Clone)]
pub struct SandboxManager {
    base: PathBuf,
}

impl SandboxManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Platform default base. Windows gets a user-public root so sandboxes
    /// survive profile redirection; elsewhere the system temp dir is used.
    pub fn default_base() -> PathBuf {
        if cfg!(windows) {
            let public =
                std::env::var("PUBLIC").unwrap_or_else(|_| r"C:\Users\Public".to_string());
            PathBuf::from(public).join("conclave-lab")
        } else {
            std::env::temp_dir().join("conclave-lab")
        }
    }

    /// Create the sandbox for a task by filtered copy. On partial failure
    /// the half-built directory is removed before the error surfaces.
    pub fn allocate(&self, task: &Task) -> Result<PathBuf, SandboxError> {
        let workspace = PathBuf::from(&task.workspace_path);
        if !workspace.is_dir() {
            return Err(SandboxError::MissingWorkspace(task.workspace_path.clone()));
        }

        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let dest = self
            .base
            .join(format!("{}-lab", task.project_slug()))
            .join(format!("{}-{}", stamp, task.id));

        if let Err(e) = copy_filtered_tree(&workspace, &dest) {
            warn!(task_id = %task.id, dest = %dest.display(), error = %e, "sandbox copy failed, rolling back");
            let _ = fs::remove_dir_all(&dest);
            return Err(e);
        }

        info!(task_id = %task.id, sandbox = %dest.display(), "sandbox allocated");
        Ok(dest)
    }

    /// Remove a generated sandbox once the task passed and merged. No-op
    /// for user-supplied paths and non-final tasks.
    pub fn cleanup(&self, task: &Task) -> Result<(), SandboxError> {
        if !task.sandbox_generated || !task.auto_merge_completed {
            return Ok(());
        }
        let Some(path) = &task.sandbox_path else {
            return Ok(());
        };
        let path = PathBuf::from(path);
        if path.starts_with(&self.base) && path.is_dir() {
            info!(task_id = %task.id, sandbox = %path.display(), "removing sandbox");
            fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?;
        }
        Ok(())
    }
}

/// Filtered copy of a tree: `.git`, cache directories, secret files, and
/// symlinks are left behind. Shared by sandbox allocation and round
/// snapshots.
pub fn copy_filtered_tree(src: &Path, dest: &Path) -> Result<(), SandboxError> {
    fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;

    let walker = WalkBuilder::new(src)
        .hidden(false)
        .git_ignore(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            !(is_dir && EXCLUDED_DIRS.contains(&name.as_ref()))
        })
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if path == src {
            continue;
        }
        let rel = path.strip_prefix(src).unwrap_or(path);
        let target = dest.join(rel);

        let file_type = match entry.file_type() {
            Some(t) => t,
            None => continue,
        };
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
        } else if file_type.is_file() {
            let name = entry.file_name().to_string_lossy();
            if is_secret_file(&name) {
                debug!(path = %path.display(), "secret file excluded from sandbox");
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            fs::copy(path, &target).map_err(|e| io_err(&target, e))?;
        }
        // Symlinks are dropped: a link out of the workspace would leak
        // the very paths the sandbox isolates.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join("node_modules/dep")).unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(root.join(".env"), "SECRET=1").unwrap();
        fs::write(root.join("server.pem"), "---").unwrap();
        fs::write(root.join(".git/config"), "[core]").unwrap();
        fs::write(root.join("node_modules/dep/index.js"), "x").unwrap();
        fs::write(root.join("README.md"), "# hi").unwrap();
        dir
    }

    fn task_for(workspace: &Path) -> Task {
        let mut task = crate::task::types::tests::test_task();
        task.workspace_path = workspace.display().to_string();
        task
    }

    #[test]
    fn test_allocate_filters_git_caches_and_secrets() {
        let workspace = seeded_workspace();
        let base = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(base.path());

        let task = task_for(workspace.path());
        let sandbox = manager.allocate(&task).unwrap();

        assert!(sandbox.join("src/main.rs").is_file());
        assert!(sandbox.join("README.md").is_file());
        assert!(!sandbox.join(".git").exists());
        assert!(!sandbox.join("node_modules").exists());
        assert!(!sandbox.join(".env").exists());
        assert!(!sandbox.join("server.pem").exists());
    }

    #[test]
    fn test_allocate_missing_workspace() {
        let base = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(base.path());
        let mut task = crate::task::types::tests::test_task();
        task.workspace_path = "/definitely/not/here".to_string();
        assert!(matches!(
            manager.allocate(&task),
            Err(SandboxError::MissingWorkspace(_))
        ));
    }

    #[test]
    fn test_cleanup_only_generated_and_merged() {
        let workspace = seeded_workspace();
        let base = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(base.path());

        let mut task = task_for(workspace.path());
        let sandbox = manager.allocate(&task).unwrap();
        task.sandbox_path = Some(sandbox.display().to_string());
        task.sandbox_generated = true;

        // Not merged yet: kept.
        manager.cleanup(&task).unwrap();
        assert!(sandbox.is_dir());

        task.auto_merge_completed = true;
        manager.cleanup(&task).unwrap();
        assert!(!sandbox.exists());
    }

    #[test]
    fn test_cleanup_never_touches_user_supplied_path() {
        let external = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(base.path());

        let mut task = crate::task::types::tests::test_task();
        task.sandbox_path = Some(external.path().display().to_string());
        task.sandbox_generated = false;
        task.auto_merge_completed = true;

        manager.cleanup(&task).unwrap();
        assert!(external.path().is_dir());
    }

    #[test]
    fn test_secret_patterns() {
        assert!(is_secret_file(".env"));
        assert!(is_secret_file(".env.local"));
        assert!(is_secret_file("tls.key"));
        assert!(is_secret_file("id_rsa"));
        assert!(!is_secret_file("main.rs"));
        assert!(!is_secret_file("envelope.rs"));
    }
}

//! Preflight checks — workspace fingerprinting for the resume guard and
//! the risk gate that runs before any participant is invoked.

use std::path::Path;

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::task::Task;

/// Stable digest over workspace shape: sorted relative paths and file
/// sizes. Content hashing would be prohibitively slow on large trees and
/// the guard only needs to notice that the workspace moved under the task.
pub fn workspace_fingerprint(root: &Path) -> String {
    let mut entries: Vec<(String, u64)> = Vec::new();
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .build();
    for entry in walker.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        entries.push((rel, len));
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for (rel, len) in entries {
        hasher.update(rel.as_bytes());
        hasher.update(len.to_le_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

/// Result of the resume-guard fingerprint comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeCheck {
    pub expected: String,
    pub actual: String,
    pub matches: bool,
}

impl ResumeCheck {
    /// Compare a task's recorded fingerprint against the workspace now.
    pub fn run(task: &Task) -> Self {
        let actual = workspace_fingerprint(Path::new(&task.workspace_path));
        let matches = actual == task.workspace_fingerprint;
        if !matches {
            debug!(task_id = %task.id, "workspace fingerprint mismatch");
        }
        Self {
            expected: task.workspace_fingerprint.clone(),
            actual,
            matches,
        }
    }
}

/// One finding from the preflight risk gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFinding {
    pub code: String,
    pub detail: String,
    pub blocking: bool,
}

/// Risk checks evaluated before any adapter call or sandbox allocation.
#[derive(Debug, Default)]
pub struct PreflightRiskGate;

impl PreflightRiskGate {
    /// Evaluate a task. The gate fails when any blocking finding exists.
    pub fn evaluate(task: &Task) -> Vec<RiskFinding> {
        let mut findings = Vec::new();

        if !Path::new(&task.workspace_path).is_dir() {
            findings.push(RiskFinding {
                code: "workspace_missing".to_string(),
                detail: task.workspace_path.clone(),
                blocking: true,
            });
        }

        if task.options.auto_merge {
            match &task.merge_target_path {
                None => findings.push(RiskFinding {
                    code: "merge_target_missing".to_string(),
                    detail: "auto_merge requires merge_target_path".to_string(),
                    blocking: true,
                }),
                Some(target) if !Path::new(target).is_dir() => findings.push(RiskFinding {
                    code: "merge_target_absent".to_string(),
                    detail: target.clone(),
                    blocking: true,
                }),
                Some(_) => {}
            }
        }

        if !task.options.sandbox_mode {
            if task.options.repair_mode == crate::task::RepairMode::Structural {
                findings.push(RiskFinding {
                    code: "structural_repair_without_sandbox".to_string(),
                    detail: "structural rewrites must run in a sandbox".to_string(),
                    blocking: true,
                });
            }
            if task.options.evolution_level >= 2 {
                findings.push(RiskFinding {
                    code: "high_evolution_without_sandbox".to_string(),
                    detail: format!("evolution_level={}", task.options.evolution_level),
                    blocking: true,
                });
            }
        }

        if task.options.auto_merge && task.options.test_command.is_none() {
            // Auto-merge without a verification command can never satisfy
            // the evidence guard; surface it before any round runs.
            findings.push(RiskFinding {
                code: "auto_merge_without_tests".to_string(),
                detail: "configure test_command or disable auto_merge".to_string(),
                blocking: true,
            });
        }

        findings
    }

    pub fn passes(findings: &[RiskFinding]) -> bool {
        !findings.iter().any(|f| f.blocking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_fingerprint_stable_and_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        fs::write(dir.path().join("b.txt"), "two").unwrap();

        let fp1 = workspace_fingerprint(dir.path());
        let fp2 = workspace_fingerprint(dir.path());
        assert_eq!(fp1, fp2);

        fs::write(dir.path().join("c.txt"), "three").unwrap();
        let fp3 = workspace_fingerprint(dir.path());
        assert_ne!(fp1, fp3);
    }

    #[test]
    fn test_resume_check_detects_drift() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();

        let mut task = crate::task::types::tests::test_task();
        task.workspace_path = dir.path().display().to_string();
        task.workspace_fingerprint = workspace_fingerprint(dir.path());

        assert!(ResumeCheck::run(&task).matches);

        fs::write(dir.path().join("drift.txt"), "x").unwrap();
        assert!(!ResumeCheck::run(&task).matches);
    }

    #[test]
    fn test_risk_gate_blocks_missing_workspace() {
        let mut task = crate::task::types::tests::test_task();
        task.workspace_path = "/no/such/dir".to_string();
        let findings = PreflightRiskGate::evaluate(&task);
        assert!(!PreflightRiskGate::passes(&findings));
        assert!(findings.iter().any(|f| f.code == "workspace_missing"));
    }

    #[test]
    fn test_risk_gate_auto_merge_requirements() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = crate::task::types::tests::test_task();
        task.workspace_path = dir.path().display().to_string();
        task.options.auto_merge = true;
        task.options.test_command = None;

        let findings = PreflightRiskGate::evaluate(&task);
        assert!(findings.iter().any(|f| f.code == "merge_target_missing"));
        assert!(findings.iter().any(|f| f.code == "auto_merge_without_tests"));

        task.merge_target_path = Some(dir.path().display().to_string());
        task.options.test_command = Some("cargo test".to_string());
        let findings = PreflightRiskGate::evaluate(&task);
        assert!(PreflightRiskGate::passes(&findings));
    }

    #[test]
    fn test_risk_gate_structural_without_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = crate::task::types::tests::test_task();
        task.workspace_path = dir.path().display().to_string();
        task.options.sandbox_mode = false;
        task.options.repair_mode = crate::task::RepairMode::Structural;

        let findings = PreflightRiskGate::evaluate(&task);
        assert!(!PreflightRiskGate::passes(&findings));
    }
}

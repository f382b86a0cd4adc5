//! Evidence guard — "no evidence, no merge".
//!
//! A round can only complete a task when verification actually executed,
//! its outputs reference at least one evidence path per required category,
//! and the bundle was persisted. Auto-merge and round promotion both
//! re-invoke this guard before touching the merge target.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::ArtifactStore;
use crate::task::GateReason;

/// One executed verification command with its observable result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvidence {
    pub command: String,
    pub exit_code: Option<i32>,
    /// Tail of combined output, bounded by the executor.
    pub output_tail: String,
}

/// What the round executor hands the guard.
#[derive(Debug, Clone, Default)]
pub struct EvidenceInput {
    pub verification_executed: bool,
    pub commands: Vec<CommandEvidence>,
    /// Paths referenced by the implementation output.
    pub implementation_paths: Vec<String>,
    /// Paths referenced by verification output (logs, reports, tests).
    pub verification_paths: Vec<String>,
}

/// Serialized attestation persisted per round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub task_id: String,
    pub round: u32,
    pub commands: Vec<CommandEvidence>,
    /// Category → referenced evidence paths.
    pub evidence: BTreeMap<String, Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl EvidenceBundle {
    pub fn rel_path(round: u32) -> String {
        format!("artifacts/evidence_bundle_round_{}.json", round)
    }
}

/// Guard verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvidenceDecision {
    Pass { bundle_path: String },
    Fail { reason: GateReason, detail: String },
}

impl EvidenceDecision {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass { .. })
    }
}

/// Pre-completion checklist evaluator.
#[derive(Debug, Default)]
pub struct EvidenceGuard;

impl EvidenceGuard {
    /// Run the checklist and, when it passes, persist the bundle and update
    /// the manifest. The bundle write is part of the contract: a pass
    /// without a persisted bundle is not a pass.
    pub fn verify(
        artifacts: &ArtifactStore,
        task_id: &str,
        round: u32,
        input: &EvidenceInput,
    ) -> EvidenceDecision {
        if !input.verification_executed || input.commands.is_empty() {
            return EvidenceDecision::Fail {
                reason: GateReason::PrecompletionCommandsMissing,
                detail: "verification did not execute any command this round".to_string(),
            };
        }

        let mut missing = Vec::new();
        if input.implementation_paths.is_empty() {
            missing.push("implementation");
        }
        if input.verification_paths.is_empty() {
            missing.push("verification");
        }
        if !missing.is_empty() {
            return EvidenceDecision::Fail {
                reason: GateReason::PrecompletionEvidenceMissing,
                detail: format!("no evidence paths for: {}", missing.join(", ")),
            };
        }

        let mut evidence = BTreeMap::new();
        evidence.insert(
            "implementation".to_string(),
            input.implementation_paths.clone(),
        );
        evidence.insert("verification".to_string(), input.verification_paths.clone());

        let bundle = EvidenceBundle {
            task_id: task_id.to_string(),
            round,
            commands: input.commands.clone(),
            evidence,
            created_at: Utc::now(),
        };
        let bundle_path = EvidenceBundle::rel_path(round);
        if let Err(e) = artifacts.write_json(task_id, &bundle_path, &bundle) {
            return EvidenceDecision::Fail {
                reason: GateReason::PrecompletionEvidenceMissing,
                detail: format!("bundle persist failed: {}", e),
            };
        }
        Self::update_manifest(artifacts, task_id, round, &bundle_path);

        EvidenceDecision::Pass { bundle_path }
    }

    /// Re-check that a previously persisted bundle exists for `round`.
    /// Used by auto-merge and promote-round.
    pub fn recheck(artifacts: &ArtifactStore, task_id: &str, round: u32) -> EvidenceDecision {
        let bundle_path = EvidenceBundle::rel_path(round);
        if artifacts.artifact_exists(task_id, &bundle_path) {
            EvidenceDecision::Pass { bundle_path }
        } else {
            EvidenceDecision::Fail {
                reason: GateReason::PrecompletionEvidenceMissing,
                detail: format!("no evidence bundle for round {}", round),
            }
        }
    }

    fn update_manifest(artifacts: &ArtifactStore, task_id: &str, round: u32, bundle_path: &str) {
        #[derive(Default, Serialize, Deserialize)]
        struct Manifest {
            bundles: BTreeMap<u32, String>,
        }

        let mut manifest: Manifest = artifacts
            .read_artifact(task_id, "artifacts/evidence_manifest.json")
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        manifest.bundles.insert(round, bundle_path.to_string());
        if let Err(e) =
            artifacts.write_json(task_id, "artifacts/evidence_manifest.json", &manifest)
        {
            tracing::warn!(task_id, error = %e, "evidence manifest update failed");
        }
    }
}

/// Pull path-looking references out of free-text participant output.
/// Used by the round executor to build [`EvidenceInput`].
pub fn extract_paths(text: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || c == '`' || c == '(' || c == ')') {
        let token = token
            .trim_matches(|c: char| matches!(c, ',' | ';' | '"' | '\'' | ':' | '*'))
            .trim_end_matches('.')
            .to_string();
        // A path reference has a separator or an extension, and no URL scheme.
        let looks_like_path = (token.contains('/') || token.contains('.'))
            && !token.contains("://")
            && token.len() > 2
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
            && token.chars().any(|c| c.is_ascii_alphanumeric())
            && token.split('.').last().map(|ext| !ext.is_empty()).unwrap_or(false);
        if looks_like_path && !paths.contains(&token) {
            paths.push(token);
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ArtifactStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ArtifactStore::new(dir.path().join(".agents")), dir)
    }

    fn passing_input() -> EvidenceInput {
        EvidenceInput {
            verification_executed: true,
            commands: vec![CommandEvidence {
                command: "cargo test".to_string(),
                exit_code: Some(0),
                output_tail: "test result: ok".to_string(),
            }],
            implementation_paths: vec!["src/lib.rs".to_string()],
            verification_paths: vec!["target/test-output.log".to_string()],
        }
    }

    #[test]
    fn test_pass_persists_bundle_and_manifest() {
        let (artifacts, _dir) = store();
        let decision = EvidenceGuard::verify(&artifacts, "t-1", 1, &passing_input());
        assert!(decision.passed());
        assert!(artifacts.artifact_exists("t-1", "artifacts/evidence_bundle_round_1.json"));
        assert!(artifacts.artifact_exists("t-1", "artifacts/evidence_manifest.json"));
    }

    #[test]
    fn test_fail_when_no_commands() {
        let (artifacts, _dir) = store();
        let mut input = passing_input();
        input.commands.clear();
        let decision = EvidenceGuard::verify(&artifacts, "t-1", 1, &input);
        assert_eq!(
            decision,
            EvidenceDecision::Fail {
                reason: GateReason::PrecompletionCommandsMissing,
                detail: "verification did not execute any command this round".to_string(),
            }
        );
    }

    #[test]
    fn test_fail_when_evidence_paths_missing() {
        let (artifacts, _dir) = store();
        let mut input = passing_input();
        input.implementation_paths.clear();
        let decision = EvidenceGuard::verify(&artifacts, "t-1", 1, &input);
        match decision {
            EvidenceDecision::Fail { reason, detail } => {
                assert_eq!(reason, GateReason::PrecompletionEvidenceMissing);
                assert!(detail.contains("implementation"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!artifacts.artifact_exists("t-1", "artifacts/evidence_bundle_round_1.json"));
    }

    #[test]
    fn test_recheck_requires_persisted_bundle() {
        let (artifacts, _dir) = store();
        assert!(!EvidenceGuard::recheck(&artifacts, "t-1", 2).passed());

        EvidenceGuard::verify(&artifacts, "t-1", 2, &passing_input());
        assert!(EvidenceGuard::recheck(&artifacts, "t-1", 2).passed());
    }

    #[test]
    fn test_extract_paths() {
        let text = "Changed src/lib.rs and `tests/api_test.rs`; logs in target/out.log. See https://example.com/x.y for docs.";
        let paths = extract_paths(text);
        assert!(paths.contains(&"src/lib.rs".to_string()));
        assert!(paths.contains(&"tests/api_test.rs".to_string()));
        assert!(paths.contains(&"target/out.log".to_string()));
        assert!(!paths.iter().any(|p| p.contains("example.com")));
    }

    #[test]
    fn test_extract_paths_ignores_plain_words() {
        let paths = extract_paths("Everything passes. No changes needed.");
        assert!(paths.is_empty(), "got {:?}", paths);
    }
}

//! Promotion guard — branch, cleanliness, and head-SHA invariants checked
//! before any write-back into the primary workspace.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::task::{GateReason, PromotionPolicy};

/// Git state of the merge target at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadSnapshot {
    pub branch: String,
    pub head_sha: String,
    pub worktree_dirty: bool,
}

impl HeadSnapshot {
    /// Capture the target's current branch, HEAD, and cleanliness via git.
    /// A non-repository target yields an empty snapshot, which the policy
    /// evaluation treats as "no git invariants to enforce".
    pub fn capture(target: &Path) -> Self {
        let branch = git_stdout(target, &["rev-parse", "--abbrev-ref", "HEAD"]);
        let head_sha = git_stdout(target, &["rev-parse", "HEAD"]);
        let status = git_stdout(target, &["status", "--porcelain"]);
        Self {
            branch,
            head_sha,
            worktree_dirty: !status.is_empty(),
        }
    }

    pub fn is_repository(&self) -> bool {
        !self.head_sha.is_empty()
    }
}

fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output();
    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).trim().to_string(),
        _ => String::new(),
    }
}

/// Outcome of a promotion guard check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub allowed: bool,
    pub reason: Option<GateReason>,
    pub detail: String,
    pub snapshot: HeadSnapshot,
}

impl PromotionDecision {
    fn allowed(snapshot: HeadSnapshot) -> Self {
        Self {
            allowed: true,
            reason: None,
            detail: String::new(),
            snapshot,
        }
    }

    fn denied(reason: GateReason, detail: String, snapshot: HeadSnapshot) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            detail,
            snapshot,
        }
    }
}

/// Validates promotion invariants against a policy.
#[derive(Debug, Default)]
pub struct PromotionGuard;

impl PromotionGuard {
    /// Pure policy evaluation over two snapshots: one taken at preflight,
    /// one taken immediately before the write-back.
    pub fn evaluate(
        policy: &PromotionPolicy,
        preflight: &HeadSnapshot,
        current: HeadSnapshot,
    ) -> PromotionDecision {
        if !current.is_repository() {
            // Nothing to enforce outside a git worktree.
            return PromotionDecision::allowed(current);
        }

        if !policy.allowed_branches.is_empty()
            && !policy.allowed_branches.contains(&current.branch)
        {
            return PromotionDecision::denied(
                GateReason::BranchNotAllowed,
                format!(
                    "branch {} not in allow-list [{}]",
                    current.branch,
                    policy.allowed_branches.join(", ")
                ),
                current,
            );
        }

        if policy.require_clean_worktree && current.worktree_dirty {
            return PromotionDecision::denied(
                GateReason::WorktreeDirty,
                "working tree has uncommitted changes".to_string(),
                current,
            );
        }

        if preflight.is_repository() && preflight.head_sha != current.head_sha {
            return PromotionDecision::denied(
                GateReason::HeadShaMismatch,
                format!(
                    "HEAD moved from {} to {} between preflight and commit",
                    preflight.head_sha, current.head_sha
                ),
                current,
            );
        }

        PromotionDecision::allowed(current)
    }

    /// Capture + evaluate against a live target path.
    pub fn check(
        policy: &PromotionPolicy,
        preflight: &HeadSnapshot,
        target: &Path,
    ) -> PromotionDecision {
        let current = HeadSnapshot::capture(target);
        debug!(branch = %current.branch, dirty = current.worktree_dirty, "promotion guard snapshot");
        Self::evaluate(policy, preflight, current)
    }
}

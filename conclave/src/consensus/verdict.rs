//! Structured reviewer verdicts and the author's issue contract.
//!
//! Reviewers are asked for JSON; free-form output falls back to a line
//! parser over `VERDICT:` / `NEXT_ACTION:` markers so a chatty reviewer
//! still produces a usable verdict. A `blocker` or `unknown` verdict must
//! carry explicit `ISSUE-xxx` ids, and author replies must answer every
//! required id.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

static ISSUE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bISSUE-[A-Za-z0-9][A-Za-z0-9_-]*\b").unwrap());
static VERDICT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*VERDICT\s*:\s*(no_blocker|blocker|unknown)\s*$").unwrap()
});
static NEXT_ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*NEXT_ACTION\s*:\s*(.+)$").unwrap());

/// Reviewer verdict value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    NoBlocker,
    Blocker,
    Unknown,
}

impl std::fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoBlocker => write!(f, "no_blocker"),
            Self::Blocker => write!(f, "blocker"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One issue raised by a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: String,
    #[serde(default)]
    pub detail: String,
}

/// Reviewer's check of one previously raised issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCheck {
    pub issue_id: String,
    pub resolved: bool,
    #[serde(default)]
    pub note: String,
}

/// Full structured verdict from one reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerVerdict {
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub issue_checks: Vec<IssueCheck>,
    #[serde(default)]
    pub reason: String,
}

impl ReviewerVerdict {
    /// Parse reviewer output: JSON first, marker lines as fallback.
    /// Returns `None` when neither shape is recognizable.
    pub fn parse(text: &str) -> Option<(Self, ParseSource)> {
        if let Some(parsed) = parse_embedded_json::<Self>(text) {
            return Some((parsed, ParseSource::Json));
        }

        let verdict = VERDICT_LINE_RE.captures(text).map(|c| match &c[1] {
            v if v.eq_ignore_ascii_case("no_blocker") => ReviewVerdict::NoBlocker,
            v if v.eq_ignore_ascii_case("blocker") => ReviewVerdict::Blocker,
            _ => ReviewVerdict::Unknown,
        })?;

        let issues = ISSUE_ID_RE
            .find_iter(text)
            .map(|m| Issue {
                issue_id: m.as_str().to_string(),
                detail: String::new(),
            })
            .collect();
        let reason = NEXT_ACTION_RE
            .captures(text)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();

        Some((
            Self {
                verdict,
                issues,
                issue_checks: Vec::new(),
                reason,
            },
            ParseSource::Fallback,
        ))
    }

    /// Synthetic verdict standing in for a reviewer whose process failed.
    pub fn unavailable(detail: &str) -> Self {
        Self {
            verdict: ReviewVerdict::Unknown,
            issues: Vec::new(),
            issue_checks: Vec::new(),
            reason: detail.to_string(),
        }
    }

    /// Ids of issues this verdict blocks on.
    pub fn open_issue_ids(&self) -> Vec<String> {
        match self.verdict {
            ReviewVerdict::NoBlocker => Vec::new(),
            _ => self.issues.iter().map(|i| i.issue_id.clone()).collect(),
        }
    }

    /// Contract check: a blocking verdict must carry well-formed ids.
    pub fn validate_contract(&self) -> Result<(), ContractViolation> {
        if self.verdict == ReviewVerdict::NoBlocker {
            return Ok(());
        }
        if self.issues.is_empty() {
            return Err(ContractViolation::BlockingWithoutIssues);
        }
        for issue in &self.issues {
            if !ISSUE_ID_RE.is_match(&issue.issue_id) {
                return Err(ContractViolation::MalformedIssueId(issue.issue_id.clone()));
            }
        }
        Ok(())
    }
}

/// How a verdict was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseSource {
    Json,
    Fallback,
}

/// Author's action on one raised issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Accept,
    Reject,
}

/// Author's response to one raised issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueResponse {
    pub issue_id: String,
    pub action: ResponseAction,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub alternative_plan: String,
    #[serde(default)]
    pub validation_commands: Vec<String>,
    #[serde(default)]
    pub evidence_paths: Vec<String>,
}

/// Author proposal reply with the issue contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorReply {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issue_responses: Vec<IssueResponse>,
}

impl AuthorReply {
    /// Parse author output; plain text degrades to a bare summary.
    pub fn parse(text: &str) -> Self {
        parse_embedded_json::<Self>(text).unwrap_or_else(|| Self {
            summary: text.trim().to_string(),
            issue_responses: Vec::new(),
        })
    }

    /// Enforce the contract against the required issue ids.
    pub fn validate_contract(&self, required: &[String]) -> Result<(), ContractViolation> {
        for id in required {
            let response = self
                .issue_responses
                .iter()
                .find(|r| &r.issue_id == id)
                .ok_or_else(|| ContractViolation::MissingResponse(id.clone()))?;

            if response.action == ResponseAction::Reject {
                let complete = !response.reason.is_empty()
                    && !response.alternative_plan.is_empty()
                    && !response.validation_commands.is_empty()
                    && !response.evidence_paths.is_empty();
                if !complete {
                    return Err(ContractViolation::IncompleteRejection(id.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Contract violations the machine turns into retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("blocking verdict lists no issues")]
    BlockingWithoutIssues,
    #[error("issue id {0:?} is not of the form ISSUE-xxx")]
    MalformedIssueId(String),
    #[error("author reply does not answer {0}")]
    MissingResponse(String),
    #[error("reject reply for {0} lacks reason, alternative plan, validation commands, or evidence paths")]
    IncompleteRejection(String),
}

/// Stable fingerprint over a set of open issue ids, for stall detection.
pub fn issue_signature(ids: &[String]) -> String {
    let mut sorted: Vec<&String> = ids.iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

/// Extract a JSON object embedded in (possibly prose-wrapped) output.
fn parse_embedded_json<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

static AUDIT_INTENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(audit|survey|discovery|inventory|catalog|broad review|whole codebase)\b")
        .unwrap()
});
static SCOPE_AMBIGUITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)scope|ambiguo|unclear (what|which)|too (broad|wide)|undefined boundar").unwrap()
});

/// Whether a task description signals broad audit/discovery intent.
pub fn is_audit_intent(description: &str) -> bool {
    AUDIT_INTENT_RE.is_match(description)
}

/// Apply audit-intent normalization to a parsed verdict: if every issue is
/// a scope-ambiguity complaint, the verdict becomes non-blocking and the
/// issues are folded into the reason as guidance.
pub fn normalize_audit_verdict(mut verdict: ReviewerVerdict, description: &str) -> ReviewerVerdict {
    if verdict.verdict != ReviewVerdict::Blocker || !is_audit_intent(description) {
        return verdict;
    }
    let all_scope = !verdict.issues.is_empty()
        && verdict
            .issues
            .iter()
            .all(|i| SCOPE_AMBIGUITY_RE.is_match(&i.detail) || SCOPE_AMBIGUITY_RE.is_match(&i.issue_id));
    if all_scope {
        let guidance: Vec<String> = verdict
            .issues
            .drain(..)
            .map(|i| format!("{}: {}", i.issue_id, i.detail))
            .collect();
        verdict.verdict = ReviewVerdict::NoBlocker;
        verdict.reason = format!(
            "scope guidance (normalized from blockers): {}",
            guidance.join("; ")
        );
    }
    verdict
}

//! Invocation requests and structural outcomes.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{ParticipantId, ParticipantOverride};

/// Which workflow phase an invocation belongs to. Carried into prompts,
/// events, and per-phase timeout selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Precheck,
    Proposal,
    ProposalReview,
    Discussion,
    Implementation,
    Review,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Precheck => write!(f, "precheck"),
            Self::Proposal => write!(f, "proposal"),
            Self::ProposalReview => write!(f, "proposal_review"),
            Self::Discussion => write!(f, "discussion"),
            Self::Implementation => write!(f, "implementation"),
            Self::Review => write!(f, "review"),
        }
    }
}

/// One streamed output chunk, forwarded as a `participant_stream` event
/// when the task runs with `stream_mode=1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub chunk: String,
    pub at: DateTime<Utc>,
}

/// A single gateway invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub participant: ParticipantId,
    pub phase: Phase,
    pub prompt: String,
    /// Directory the adapter runs in (sandbox or workspace).
    pub working_dir: PathBuf,
    /// Merged provider/participant override for this call.
    pub overrides: ParticipantOverride,
    pub deadline: Duration,
    /// Collect stream chunks alongside the final text.
    pub stream: bool,
}

/// Structural result of an invocation. Exactly one of five classes; the
/// gateway itself never returns an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvokeOutcome {
    Ok {
        text: String,
        stream_events: Vec<StreamEvent>,
    },
    Timeout {
        after_secs: u64,
    },
    NotFound,
    ProviderLimit {
        detail: String,
    },
    RuntimeError {
        detail: String,
    },
}

impl InvokeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Whether the participant was wholly unavailable (as opposed to
    /// producing a bad answer).
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::NotFound | Self::ProviderLimit { .. }
        )
    }

    /// Short classification string used in events and stats buckets.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "ok",
            Self::Timeout { .. } => "timeout",
            Self::NotFound => "not_found",
            Self::ProviderLimit { .. } => "provider_limit",
            Self::RuntimeError { .. } => "runtime_error",
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Ok { text, .. } => Some(text),
            _ => None,
        }
    }
}

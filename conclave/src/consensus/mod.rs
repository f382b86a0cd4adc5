//! Proposal consensus — the reviewer-first protocol that runs before any
//! implementation work when `self_loop_mode=0`.

pub mod machine;
pub mod verdict;

pub use machine::{ConsensusConfig, ConsensusMachine, ConsensusOutcome};
pub use verdict::{
    is_audit_intent, issue_signature, normalize_audit_verdict, AuthorReply, ContractViolation,
    Issue, IssueCheck, IssueResponse, ParseSource, ResponseAction, ReviewVerdict, ReviewerVerdict,
};

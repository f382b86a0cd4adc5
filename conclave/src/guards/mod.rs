//! Guards that gate lifecycle transitions: preflight risk checks, the
//! workspace resume fingerprint, promotion invariants, and the
//! pre-completion evidence checklist.

pub mod evidence;
pub mod preflight;
pub mod promotion;

pub use evidence::{CommandEvidence, EvidenceBundle, EvidenceDecision, EvidenceGuard, EvidenceInput};
pub use preflight::{workspace_fingerprint, PreflightRiskGate, ResumeCheck, RiskFinding};
pub use promotion::{HeadSnapshot, PromotionDecision, PromotionGuard};

//! Participant gateway — uniform invocation of external agent CLIs.
//!
//! The gateway never raises for participant failure: every call returns a
//! structural [`InvokeOutcome`] that the consensus machine and round
//! executor pattern-match on.

pub mod adapter;
pub mod outcome;

pub use adapter::CliGateway;
pub use outcome::{InvokeOutcome, InvokeRequest, Phase, StreamEvent};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Capability the core uses to talk to participants. A trait so tests and
/// alternative transports can script participant behavior.
#[async_trait]
pub trait ParticipantGateway: Send + Sync {
    async fn invoke(&self, request: InvokeRequest, cancel: &CancellationToken) -> InvokeOutcome;
}

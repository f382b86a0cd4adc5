//! Task data model — identity, options, status graph, and the event log types.

pub mod events;
pub mod types;

pub use events::{EventKind, TaskEvent};
pub use types::{
    AuthorDecision, AuthorVerdict, ConversationLanguage, GateReason, MemoryMode, ParticipantId,
    ParticipantIdError, ParticipantOverride, PhaseTimeouts, PromotionPolicy, Provider, RepairMode,
    Task, TaskOptions, TaskStatus,
};

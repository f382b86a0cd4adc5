//! Persistence — the task repository (records, CAS transitions, event
//! sequencing) and the artifact store (append-only logs and named blobs).

pub mod artifacts;
pub mod repository;

pub use artifacts::{ArtifactError, ArtifactStore};
pub use repository::{MemoryRepository, SharedRepository, StoreError, StoreResult, TaskRepository};

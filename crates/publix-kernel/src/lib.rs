//! Publix kernel: entity models and collaborator interfaces.
//!
//! The kernel knows nothing about HTTP or tokens. It defines the records the
//! study-execution engine moves through its state machine (workers, batches,
//! studies, components, runs, component-runs, groups), the persistence
//! interface they are loaded from and committed to, and the audit-log and
//! group-channel seams the engine reports to.

pub mod audit;
pub mod channel;
pub mod error;
pub mod identity;
pub mod memory_store;
pub mod models;
pub mod store;

pub use audit::{AuditEntry, AuditLog, MemoryAuditLog, TracingAuditLog};
pub use channel::{GroupChannel, NoopGroupChannel};
pub use error::StoreError;
pub use identity::{BatchId, ComponentId, ComponentRunId, GroupId, RunId, Seq, StudyId, WorkerId};
pub use memory_store::{InMemoryPublixStore, StoreSeed};
pub use models::{
    Batch, Component, ComponentRun, ComponentRunState, Group, GroupState, Run, RunState, Study,
    Worker, WorkerCapabilities, WorkerKind,
};
pub use store::{ChangeSet, EntityKind, PublixStore};

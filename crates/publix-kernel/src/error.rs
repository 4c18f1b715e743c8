//! Persistence error type.

use crate::store::EntityKind;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: u64 },
    #[error("store conflict: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: EntityKind, id: u64) -> Self {
        Self::NotFound { kind, id }
    }
}

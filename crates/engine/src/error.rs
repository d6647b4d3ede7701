use sheetwright_core::{CoreError, EntityId, SessionId};
use sheetwright_storage::StorageError;
use thiserror::Error;

use crate::draft::ValidationIssue;
use crate::session::SessionStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("validation failed: {}", summarize(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("entity {entity_id} already has open session {holder}")]
    Conflict { entity_id: EntityId, holder: SessionId },

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("operation {operation} allows {budget} sub-mutations, plan has {requested}")]
    PolicyViolation {
        operation: String,
        requested: usize,
        budget: usize,
    },

    #[error("entity {entity_id} is at revision {actual}, session was based on {expected}")]
    StaleBase {
        entity_id: EntityId,
        expected: u64,
        actual: u64,
    },

    #[error("write failed on entity {entity_id}, {reverted} writes reverted: {failure}")]
    PersistenceFailure {
        entity_id: EntityId,
        reverted: usize,
        #[source]
        failure: StorageError,
    },

    #[error(
        "write failed on entity {entity_id} and {unreverted} compensating writes failed \
         (first: {compensation}); persisted state is partial: {failure}"
    )]
    CompensationFailed {
        entity_id: EntityId,
        unreverted: usize,
        #[source]
        failure: StorageError,
        compensation: StorageError,
    },

    #[error("recalculation re-entered for entity {0}")]
    RecalculationReentered(EntityId),

    #[error("session {session_id} is {status}")]
    SessionClosed {
        session_id: SessionId,
        status: SessionStatus,
    },
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("entity collision: {entity_id}")]
    EntityCollision { entity_id: String },

    #[error("write rejected: {0}")]
    WriteRejected(String),

    #[error("core error: {0}")]
    Core(#[from] sheetwright_core::CoreError),
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

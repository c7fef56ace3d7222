use std::io;

/// Crate-local error type for `msim-store` operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("invalid data: {0}")]
    Validation(String),

    #[error("output is incomplete: {0}")]
    Incomplete(String),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("store lock poisoned")]
    Poisoned,
}

impl From<msim_types::TypesError> for StoreError {
    fn from(e: msim_types::TypesError) -> Self {
        Self::Validation(e.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StoreError>;

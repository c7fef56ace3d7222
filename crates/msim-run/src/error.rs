use msim_msg::MsgError;
use msim_store::StoreError;
use msim_types::{RunId, TypesError};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Bad configuration, topology input or missing metadata.
    #[error("validation error: {0}")]
    Validation(String),

    /// Malformed or unexpected message between root and child.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] MsgError),

    #[error("database error: {0}")]
    Store(#[from] StoreError),

    #[error("sub-value {sub_value_id} of run {run_id} failed: {message}")]
    Worker { run_id: RunId, sub_value_id: usize, message: String },

    #[error("child process {rank} failed with status {status}")]
    ChildFailed { rank: usize, status: String },

    #[error("worker task join error: {0}")]
    Join(String),
}

impl From<TypesError> for RunError {
    fn from(e: TypesError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl RunError {
    /// Process exit status for this error.
    ///
    /// ```text
    ///  1  unknown        8  messaging     12  database
    /// 16  model          32  simulation
    /// ```
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Transport(_) | Self::Protocol(_) | Self::ChildFailed { .. } => 8,
            Self::Store(_) => 12,
            Self::Validation(_) => 16,
            Self::Worker { .. } => 32,
            Self::Join(_) => 1,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RunError>;

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_family() {
        assert_eq!(RunError::Transport(MsgError::NoGroups).exit_code(), 8);
        assert_eq!(RunError::Store(StoreError::Poisoned).exit_code(), 12);
        assert_eq!(RunError::Validation("x".into()).exit_code(), 16);
        let worker = RunError::Worker { run_id: 1, sub_value_id: 2, message: "boom".into() };
        assert_eq!(worker.exit_code(), 32);
        assert_eq!(RunError::Join("panic".into()).exit_code(), 1);
    }

    #[test]
    fn config_errors_are_validation_errors() {
        let err: RunError = TypesError::Config("threads".into()).into();
        assert!(matches!(err, RunError::Validation(_)));
    }
}

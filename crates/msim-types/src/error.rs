// Shared error type for catalog and configuration validation.

#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("invalid parameter value: {0}")]
    ParamValue(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, TypesError>;

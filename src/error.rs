use thiserror::Error;

/// Errors surfaced by the reconciliation engine.
///
/// Degraded-but-recoverable situations (an unparsable statement row, a rule
/// with a broken regex) are not errors; they are logged and counted where
/// they happen. `ReconError` is for failures the caller must handle.
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type ReconResult<T> = Result<T, ReconError>;

/// Configuration loading failures, kept separate from runtime errors so a
/// bad environment fails fast at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

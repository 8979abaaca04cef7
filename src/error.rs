// afc-server: Error types

use thiserror::Error;

use crate::validation::ValidationFailure;

/// Coordinator result type
pub type AfcResult<T> = Result<T, AfcError>;

/// Errors raised while processing a spectrum inquiry
#[derive(Debug, Error)]
pub enum AfcError {
    #[error("Request processing timed out")]
    Timeout,

    #[error("Invalid request structure")]
    Validation(ValidationFailure),

    #[error("Database error: {0}")]
    Db(String),

    #[error("Cache error: {0}")]
    Rcache(#[from] afc_rcache::RcacheError),

    #[error("Message bus error: {0}")]
    Bus(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for AfcError {
    fn from(err: serde_json::Error) -> Self {
        AfcError::Internal(format!("JSON error: {err}"))
    }
}

impl From<sqlx::Error> for AfcError {
    fn from(err: sqlx::Error) -> Self {
        AfcError::Db(err.to_string())
    }
}

impl From<lapin::Error> for AfcError {
    fn from(err: lapin::Error) -> Self {
        AfcError::Bus(err.to_string())
    }
}

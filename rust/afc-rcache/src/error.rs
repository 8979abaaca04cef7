// afc-rcache: Error types

use thiserror::Error;

/// Rcache result type
pub type RcacheResult<T> = Result<T, RcacheError>;

/// Rcache error types
#[derive(Debug, Error)]
pub enum RcacheError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Message bus error: {0}")]
    Bus(#[from] lapin::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Malformed cache record: {0}")]
    BadRecord(String),
}

impl From<reqwest::Error> for RcacheError {
    fn from(err: reqwest::Error) -> Self {
        RcacheError::Http(err.to_string())
    }
}

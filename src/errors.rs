//! Closed error taxonomy shared by every component (spec.md §7).
//!
//! `NotFound` and `InvalidInput` are never fatal — they are returned in a
//! response envelope and logged. `Fatal` triggers the shutdown sequence with
//! in-memory state preserved; callers that detect a fatal condition should
//! propagate it up to `main` rather than swallow it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PylonError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PylonError {
    /// The stable string used as `{success:false, error:"..."}` over the
    /// relay and the loopback TCP services — the inner payload only, with
    /// no kind prefix. Use `Display`/`to_string()` for logs instead.
    pub fn message(&self) -> String {
        match self {
            PylonError::NotFound(m)
            | PylonError::InvalidInput(m)
            | PylonError::Conflict(m)
            | PylonError::Timeout(m)
            | PylonError::Upstream(m)
            | PylonError::Fatal(m) => m.clone(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PylonError::Fatal(_))
    }
}

impl From<sqlx::Error> for PylonError {
    fn from(e: sqlx::Error) -> Self {
        PylonError::Upstream(format!("storage: {e}"))
    }
}

impl From<std::io::Error> for PylonError {
    fn from(e: std::io::Error) -> Self {
        PylonError::Upstream(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for PylonError {
    fn from(e: serde_json::Error) -> Self {
        PylonError::InvalidInput(format!("invalid JSON format: {e}"))
    }
}

pub type PylonResult<T> = Result<T, PylonError>;

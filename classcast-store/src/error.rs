//! Coordination store errors.

use classcast_protocol::{ErrorCode, ProtocolError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("coordination store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("key '{key}' holds a {actual}, not a {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("store rejected request: {code}: {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true when the failure is an outage rather than a bad call.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_)
            | StoreError::Timeout(_)
            | StoreError::Protocol(_)
            | StoreError::Io(_) => true,
            StoreError::Rejected { code, .. } => *code == ErrorCode::StoreUnavailable,
            _ => false,
        }
    }

    /// Maps the error to a stable protocol code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StoreError::WrongType { .. } | StoreError::InvalidParams(_) => {
                ErrorCode::ValidationError
            }
            StoreError::Rejected { code, .. } => *code,
            StoreError::Json(_) => ErrorCode::InternalError,
            _ => ErrorCode::StoreUnavailable,
        }
    }
}

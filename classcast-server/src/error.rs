//! Gateway error types.

use classcast_protocol::ErrorCode;
use classcast_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] classcast_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u16),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limit exceeded for '{command}', retry in {retry_after_ms} ms")]
    RateLimited { command: String, retry_after_ms: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("fan-out transport failed: {0}")]
    Fanout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ServerError::Unauthorized(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ServerError::Validation(msg.into())
    }

    /// Converts to the protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Protocol(_) | ServerError::Json(_) | ServerError::BadRequest(_) => {
                ErrorCode::BadRequest
            }
            ServerError::Store(e) => e.error_code(),
            ServerError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            ServerError::Unauthorized(_) => ErrorCode::Unauthorized,
            ServerError::RateLimited { .. } => ErrorCode::RateLimited,
            ServerError::Validation(_) => ErrorCode::ValidationError,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::Io(_)
            | ServerError::Fanout(_)
            | ServerError::Internal(_)
            | ServerError::ShuttingDown => ErrorCode::InternalError,
        }
    }

    /// Returns whether the client may retry the same command.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }

    /// Message safe to return to a client. Internal details stay in logs.
    pub fn client_message(&self) -> String {
        match self.error_code() {
            ErrorCode::InternalError => "internal error".to_string(),
            ErrorCode::StoreUnavailable => "coordination store unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

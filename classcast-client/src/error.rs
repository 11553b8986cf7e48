//! Client error types.

use classcast_protocol::{AckError, ErrorCode};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] classcast_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("server error: {} - {message}", code.as_str())]
    ServerError {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::ServerError { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns the server error code, if the server rejected the request.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::ServerError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Errors after which reconnecting with the same settings cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code(),
            Some(ErrorCode::Unauthorized | ErrorCode::UnsupportedProtocol | ErrorCode::NotFound)
        )
    }
}

impl From<AckError> for ClientError {
    fn from(err: AckError) -> Self {
        ClientError::ServerError {
            code: err.code,
            message: err.message,
            retryable: err.retryable,
        }
    }
}

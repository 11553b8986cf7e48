//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while framing or parsing messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'CCST', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("line too long: {0} bytes without a newline")]
    LineTooLong(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
}

/// Stable error codes carried in acks and store responses.
///
/// These codes are part of the client contract and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol
    UnsupportedProtocol,
    BadRequest,

    // Caller
    Unauthorized,
    RateLimited,
    ValidationError,
    NotFound,

    // System
    StoreUnavailable,
    InternalError,
}

impl ErrorCode {
    /// Returns whether the caller may retry the same command later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::StoreUnavailable | ErrorCode::InternalError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::RateLimited.is_retryable());
        assert!(ErrorCode::StoreUnavailable.is_retryable());
        assert!(ErrorCode::InternalError.is_retryable());

        assert!(!ErrorCode::Unauthorized.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::NotFound.is_retryable());
        assert!(!ErrorCode::BadRequest.is_retryable());
    }

    #[test]
    fn test_display_matches_wire_form() {
        for code in [
            ErrorCode::UnsupportedProtocol,
            ErrorCode::BadRequest,
            ErrorCode::Unauthorized,
            ErrorCode::RateLimited,
            ErrorCode::ValidationError,
            ErrorCode::NotFound,
            ErrorCode::StoreUnavailable,
            ErrorCode::InternalError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code));
        }
    }

    #[test]
    fn test_parse_code() {
        let parsed: ErrorCode = serde_json::from_str("\"STORE_UNAVAILABLE\"").unwrap();
        assert_eq!(parsed, ErrorCode::StoreUnavailable);
        assert!(serde_json::from_str::<ErrorCode>("\"WAL_IO_ERROR\"").is_err());
    }

    #[test]
    fn test_protocol_error_display() {
        assert!(ProtocolError::InvalidMagic(*b"XXXX")
            .to_string()
            .contains("magic"));
        assert!(ProtocolError::UnsupportedVersion(9).to_string().contains('9'));
        assert!(ProtocolError::LineTooLong(4096).to_string().contains("4096"));
        let msg = ProtocolError::CrcMismatch {
            expected: 0xABC,
            actual: 0xDEF,
        }
        .to_string();
        assert!(msg.contains("0xabc"));
    }
}

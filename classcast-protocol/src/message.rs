//! Gateway envelopes exchanged between clients and the gateway.
//!
//! A connection opens with one [`Handshake`], after which the client sends
//! [`Inbound`] commands and the server writes [`ServerMessage`]s: either an
//! [`Ack`] answering a command or an [`Outbound`] event pushed to a room.

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_protocol_version() -> u16 {
    crate::PROTOCOL_VERSION
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// First message on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Bearer credential (a signed JWT, optionally prefixed with "Bearer ").
    pub token: String,

    /// Namespace path the connection binds to, e.g. "/messaging".
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
}

impl Handshake {
    pub fn new(token: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            namespace: namespace.into(),
            client_name: None,
            protocol_version: crate::PROTOCOL_VERSION,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }
}

/// A command sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    /// Correlation id echoed in the ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub command: String,

    #[serde(default = "empty_object")]
    pub payload: Value,
}

impl Inbound {
    pub fn new(command: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            command: command.into(),
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// An event pushed to every connection subscribed to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub event: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Outbound {
    /// Creates an event stamped with the current time.
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Error body of a failed ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Acknowledgment of an inbound command (or of the handshake).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl Ack {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(AckError {
                code,
                message: message.into(),
                retryable: code.is_retryable(),
            }),
        }
    }

    /// Returns the error code of a failed ack.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Anything the gateway writes to a client after the handshake.
///
/// The two shapes are distinguished by their fields, so the envelope carries
/// no type tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(Outbound),
    Ack(Ack),
}

impl From<Outbound> for ServerMessage {
    fn from(event: Outbound) -> Self {
        ServerMessage::Event(event)
    }
}

impl From<Ack> for ServerMessage {
    fn from(ack: Ack) -> Self {
        ServerMessage::Ack(ack)
    }
}

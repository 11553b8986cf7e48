//! Messages spoken between gateways and the coordination store daemon.
//!
//! Requests and responses are correlated by a numeric id. Publications on a
//! subscribed channel arrive as unsolicited [`Publication`] messages.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coordination store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreOp {
    #[serde(rename = "HELLO")]
    Hello,
    #[serde(rename = "PING")]
    Ping,

    #[serde(rename = "HSET")]
    HashSet,
    #[serde(rename = "HGET")]
    HashGet,
    #[serde(rename = "HGETALL")]
    HashGetAll,
    #[serde(rename = "HDEL")]
    HashDelete,

    #[serde(rename = "SADD")]
    SetAdd,
    #[serde(rename = "SISMEMBER")]
    SetIsMember,
    #[serde(rename = "SREM")]
    SetRemove,

    #[serde(rename = "RPUSH")]
    ListPush,
    #[serde(rename = "LRANGE")]
    ListRange,
    #[serde(rename = "LREM")]
    ListRemove,
    #[serde(rename = "LLEN")]
    ListLength,

    #[serde(rename = "DEL")]
    Delete,
    #[serde(rename = "EXPIRE")]
    Expire,
    #[serde(rename = "EXPIRE_NX")]
    ExpireNx,

    #[serde(rename = "PUBLISH")]
    Publish,
    #[serde(rename = "SUBSCRIBE")]
    Subscribe,
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Hello => "HELLO",
            StoreOp::Ping => "PING",
            StoreOp::HashSet => "HSET",
            StoreOp::HashGet => "HGET",
            StoreOp::HashGetAll => "HGETALL",
            StoreOp::HashDelete => "HDEL",
            StoreOp::SetAdd => "SADD",
            StoreOp::SetIsMember => "SISMEMBER",
            StoreOp::SetRemove => "SREM",
            StoreOp::ListPush => "RPUSH",
            StoreOp::ListRange => "LRANGE",
            StoreOp::ListRemove => "LREM",
            StoreOp::ListLength => "LLEN",
            StoreOp::Delete => "DEL",
            StoreOp::Expire => "EXPIRE",
            StoreOp::ExpireNx => "EXPIRE_NX",
            StoreOp::Publish => "PUBLISH",
            StoreOp::Subscribe => "SUBSCRIBE",
            StoreOp::Unsubscribe => "UNSUBSCRIBE",
        }
    }

    /// Operations that mutate keyspace state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StoreOp::HashSet
                | StoreOp::HashDelete
                | StoreOp::SetAdd
                | StoreOp::SetRemove
                | StoreOp::ListPush
                | StoreOp::ListRemove
                | StoreOp::Delete
                | StoreOp::Expire
                | StoreOp::ExpireNx
        )
    }
}

/// Request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRequest {
    /// Message type, always "request".
    #[serde(rename = "type")]
    pub msg_type: String,
    pub id: u64,
    pub op: StoreOp,
    #[serde(default)]
    pub params: Value,
}

impl StoreRequest {
    pub fn new(id: u64, op: StoreOp, params: Value) -> Self {
        Self {
            msg_type: "request".to_string(),
            id,
            op,
            params,
        }
    }
}

/// Error details in a store response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFailure {
    pub code: ErrorCode,
    pub message: String,
}

/// Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResponse {
    /// Message type, always "response".
    #[serde(rename = "type")]
    pub msg_type: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StoreFailure>,
}

impl StoreResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            msg_type: "response".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            msg_type: "response".to_string(),
            id,
            result: None,
            error: Some(StoreFailure {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    /// Message type, always "message".
    #[serde(rename = "type")]
    pub msg_type: String,
    pub channel: String,
    pub payload: Value,
}

impl Publication {
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            msg_type: "message".to_string(),
            channel: channel.into(),
            payload,
        }
    }
}

/// Anything the daemon writes to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreServerMessage {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<StoreFailure>,
    },
    Message {
        channel: String,
        payload: Value,
    },
}

impl StoreServerMessage {
    /// Splits a server message into a response or a channel publication.
    pub fn into_response(self) -> Result<StoreResponse, Publication> {
        match self {
            StoreServerMessage::Response { id, result, error } => Ok(StoreResponse {
                msg_type: "response".to_string(),
                id,
                result,
                error,
            }),
            StoreServerMessage::Message { channel, payload } => {
                Err(Publication::new(channel, payload))
            }
        }
    }
}

/// Parameters for HELLO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Shared secret, required when the daemon has peer tokens configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Parameters for DEL, HGETALL, LRANGE and LLEN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyParams {
    pub key: String,
}

/// Parameters for HGET and HDEL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashFieldParams {
    pub key: String,
    pub field: String,
}

/// Parameters for HSET.
///
/// With `ttl_ms` the key's expiration is set in the same operation: always,
/// or with `ttl_nx` only when the key has none yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashSetParams {
    pub key: String,
    pub field: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ttl_nx: bool,
}

/// Parameters for SADD, SISMEMBER and SREM. `ttl_ms` applies to SADD only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetMemberParams {
    pub key: String,
    pub member: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ttl_nx: bool,
}

/// Parameters for RPUSH and LREM. `ttl_ms` applies to RPUSH only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListValueParams {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ttl_nx: bool,
}

/// Parameters for EXPIRE and EXPIRE_NX.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpireParams {
    pub key: String,
    pub ttl_ms: u64,
}

/// Parameters for PUBLISH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishParams {
    pub channel: String,
    pub payload: Value,
}

/// Parameters for SUBSCRIBE and UNSUBSCRIBE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelParams {
    pub channel: String,
}

//! # classcast-client
//!
//! Client library for the classcast gateway.
//!
//! This crate provides:
//! - Async TCP connections in binary or line-delimited JSON mode
//! - Automatic reconnection with exponential backoff
//! - Room re-join after reconnect and periodic heartbeats
//! - Event subscriptions by name, optionally typed
//! - Observable connection status

pub mod client;
pub mod connection;
pub mod error;

pub use client::{ConnectionStatus, RealtimeClient, ReconnectPolicy, Subscription};
pub use connection::{Connection, ConnectionConfig, HandshakeInfo};
pub use error::ClientError;

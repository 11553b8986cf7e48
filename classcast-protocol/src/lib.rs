//! # classcast-protocol
//!
//! Wire protocol shared by the classcast gateway, its clients and the
//! coordination store daemon.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - Line-delimited JSON framing for debugging clients
//! - Gateway envelopes (handshake, inbound command, outbound event, ack)
//! - Coordination store request/response types
//! - Stable error codes

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod store;

pub use codec::{Decoder, Encoder, WireMode};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{Ack, AckError, Handshake, Inbound, Outbound, ServerMessage};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the gateway.
pub const DEFAULT_GATEWAY_PORT: u16 = 7410;

/// Default port for the coordination store daemon.
pub const DEFAULT_STORE_PORT: u16 = 7411;

/// Maximum frame payload size (1 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

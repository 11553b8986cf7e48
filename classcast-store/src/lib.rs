//! Coordination store for classcast.
//!
//! Gateway processes share ephemeral state (presence, typing indicators,
//! raised hands, assessment progress) and cross-process fan-out through the
//! [`CoordinationStore`] contract. Two implementations are provided:
//!
//! - [`MemoryStore`]: in-process, used for single-process deployments, tests
//!   and as the keyspace of the store daemon
//! - [`RemoteStore`]: a client of the store daemon ([`StoreServer`]), used
//!   when several gateway processes must share state

pub mod auth;
pub mod config;
pub mod coordination;
pub mod error;
pub mod memory;
pub mod remote;
pub mod server;

pub use auth::PeerSecrets;
pub use config::{ConfigError, StoreDaemonConfig};
pub use coordination::{ChannelReceiver, CoordinationStore, Expiration};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use remote::{RemoteStore, RemoteStoreConfig};
pub use server::{StoreServer, StoreStats};

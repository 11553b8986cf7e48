//! # classcast-server
//!
//! Real-time gateway for classcast.
//!
//! This crate provides:
//! - TCP connection handling with binary or line-delimited JSON framing
//! - Credential validation and per-join room authorization
//! - Namespace handlers for gradebook, attendance, notifications, messaging,
//!   live sessions and assessments
//! - Per-connection command rate limiting
//! - Room broadcast with cross-process fan-out
//! - Prometheus metrics

pub mod access;
pub mod auth;
pub mod config;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod namespace;
pub mod rate_limit;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;

pub use access::{AccessDirectory, MemoryDirectory, ResourceRecord};
pub use auth::{Authenticator, Identity, Role, TenantPath};
pub use config::{Config, ConfigError, DeploymentMode, StoreMode};
pub use error::ServerError;
pub use fanout::{Envelope, FanoutTransport, LocalFanout, StoreFanout};
pub use handler::{ConnectionHandler, Outcome};
pub use manager::{Broadcaster, NamespaceManager};
pub use metrics::Metrics;
pub use namespace::{standard_namespaces, CommandContext, NamespaceHandler, Services};
pub use rate_limit::{RateDecision, RateLimit, RateLimiter};
pub use registry::{ConnectionRegistry, Delivery};
pub use room::{Room, Scope};
pub use server::{Server, ServerStats};
pub use session::{ConnectionId, ConnectionState, Session};

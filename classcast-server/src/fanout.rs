//! Cross-process broadcast transport.
//!
//! Every broadcast is wrapped in an [`Envelope`] and published on one shared
//! channel. Each gateway process subscribes to that channel and delivers
//! envelopes from other origins to its local connections.

use crate::error::ServerError;
use crate::room::Room;
use crate::session::ConnectionId;
use async_trait::async_trait;
use classcast_protocol::Outbound;
use classcast_store::CoordinationStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default capacity of in-process fan-out channels.
pub const DEFAULT_FANOUT_CAPACITY: usize = 4096;

/// A broadcast as it travels between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Instance id of the publishing process.
    pub origin: String,
    pub namespace: String,
    pub rooms: Vec<Room>,
    pub event: Outbound,
    /// Connection that triggered the event and must not receive it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<ConnectionId>,
}

impl Envelope {
    pub fn to_value(&self) -> Result<Value, ServerError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ServerError> {
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
pub trait FanoutTransport: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<(), ServerError>;

    /// Opens a receiver of every envelope published from now on.
    async fn subscribe(&self) -> Result<broadcast::Receiver<Value>, ServerError>;

    /// Whether envelopes leave this process.
    fn is_distributed(&self) -> bool;
}

/// In-process hub. Clones share the same channel, so several managers in
/// one process can stand in for separate gateways.
#[derive(Debug, Clone)]
pub struct LocalFanout {
    sender: broadcast::Sender<Value>,
}

impl LocalFanout {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for LocalFanout {
    fn default() -> Self {
        Self::new(DEFAULT_FANOUT_CAPACITY)
    }
}

#[async_trait]
impl FanoutTransport for LocalFanout {
    async fn publish(&self, envelope: &Envelope) -> Result<(), ServerError> {
        // No receivers is not an error.
        let _ = self.sender.send(envelope.to_value()?);
        Ok(())
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<Value>, ServerError> {
        Ok(self.sender.subscribe())
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

/// Fan-out over the coordination store's pub/sub.
pub struct StoreFanout {
    store: Arc<dyn CoordinationStore>,
    channel: String,
}

impl StoreFanout {
    pub fn new(store: Arc<dyn CoordinationStore>, channel: impl Into<String>) -> Self {
        Self {
            store,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl FanoutTransport for StoreFanout {
    async fn publish(&self, envelope: &Envelope) -> Result<(), ServerError> {
        let receivers = self
            .store
            .publish(&self.channel, envelope.to_value()?)
            .await?;
        tracing::trace!("Published envelope to {} receivers", receivers);
        Ok(())
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<Value>, ServerError> {
        Ok(self.store.subscribe(&self.channel).await?)
    }

    fn is_distributed(&self) -> bool {
        true
    }
}

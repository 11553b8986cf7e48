//! High-level client API.
//!
//! [`RealtimeClient`] keeps one logical session alive over a sequence of
//! physical connections. When the connection drops it reconnects with
//! exponential backoff, re-joins the rooms the application had joined and
//! resumes heartbeats at the interval the gateway advertised.

use crate::connection::{into_result, Connection, ConnectionConfig, HandshakeInfo};
use crate::error::ClientError;
use classcast_protocol::{Ack, Outbound};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Capacity of the event channel shared by all subscriptions.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry after a lost connection.
    Reconnecting { attempt: u32 },
    /// Closed by the application, or rejected for good by the gateway.
    Closed,
}

/// Reconnection backoff.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Give up after this many consecutive failures; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Delay before the given (zero-based) attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Events with one name, as delivered to the application.
pub struct Subscription {
    event: String,
    receiver: broadcast::Receiver<Outbound>,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next matching event; `None` once the client is dropped.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.event == self.event => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Subscription to '{}' lagged by {} events", self.event, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event with its payload decoded as `T`.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ClientError> {
        match self.recv().await {
            Some(event) => Ok(Some(serde_json::from_value(event.payload)?)),
            None => Ok(None),
        }
    }
}

struct Inner {
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    current: RwLock<Option<Arc<Connection>>>,
    info: RwLock<Option<HandshakeInfo>>,
    /// Rooms to restore after a reconnect.
    rooms: Mutex<BTreeSet<String>>,
    events: broadcast::Sender<Outbound>,
    status: watch::Sender<ConnectionStatus>,
    closed: AtomicBool,
}

/// Reconnecting client bound to one namespace.
pub struct RealtimeClient {
    inner: Arc<Inner>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_policy(config, ReconnectPolicy::default())
    }

    pub fn with_policy(config: ConnectionConfig, policy: ReconnectPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                current: RwLock::new(None),
                info: RwLock::new(None),
                rooms: Mutex::new(BTreeSet::new()),
                events,
                status,
                closed: AtomicBool::new(false),
            }),
            supervisor: std::sync::Mutex::new(None),
        }
    }

    /// Connects and starts the background supervisor.
    ///
    /// The first connection attempt is not retried; its error is returned.
    pub async fn connect(&self) -> Result<HandshakeInfo, ClientError> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.set_status(ConnectionStatus::Connecting);
        let (conn, info) = match self.inner.establish().await {
            Ok(established) => established,
            Err(e) => {
                self.inner.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        self.inner.set_status(ConnectionStatus::Connected);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.supervise(conn).await });
        if let Ok(mut guard) = self.supervisor.lock() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }
        Ok(info)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Waits until the status satisfies `predicate`.
    pub async fn wait_for_status(
        &self,
        predicate: impl Fn(&ConnectionStatus) -> bool,
    ) -> ConnectionStatus {
        let mut rx = self.watch_status();
        loop {
            let current = rx.borrow_and_update().clone();
            if predicate(&current) {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Handshake data of the current connection.
    pub async fn info(&self) -> Option<HandshakeInfo> {
        self.inner.info.read().await.clone()
    }

    /// Subscribes to events named `event`.
    pub fn subscribe(&self, event: impl Into<String>) -> Subscription {
        Subscription {
            event: event.into(),
            receiver: self.inner.events.subscribe(),
        }
    }

    /// Every event, regardless of name.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Outbound> {
        self.inner.events.subscribe()
    }

    /// Sends a command and returns the raw ack.
    pub async fn request(&self, command: &str, payload: Value) -> Result<Ack, ClientError> {
        let conn = self
            .inner
            .current
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        conn.request(command, payload).await
    }

    /// Sends a command and returns the ack data, or the server error.
    pub async fn send(&self, command: &str, payload: Value) -> Result<Value, ClientError> {
        into_result(self.request(command, payload).await?)
    }

    /// Joins a room; it is re-joined automatically after reconnects.
    pub async fn join(&self, room: &str) -> Result<Value, ClientError> {
        let data = self.send("join", json!({ "room": room })).await?;
        self.inner.rooms.lock().await.insert(room.to_string());
        Ok(data)
    }

    pub async fn leave(&self, room: &str) -> Result<Value, ClientError> {
        self.inner.rooms.lock().await.remove(room);
        self.send("leave", json!({ "room": room })).await
    }

    /// Rooms the client will restore after a reconnect.
    pub async fn rooms(&self) -> Vec<String> {
        self.inner.rooms.lock().await.iter().cloned().collect()
    }

    pub async fn heartbeat(&self) -> Result<Value, ClientError> {
        self.send("heartbeat", json!({})).await
    }

    /// Says goodbye and stops reconnecting.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let conn = self.inner.current.write().await.take();
        if let Some(conn) = conn {
            let _ = conn.request("disconnect", json!({})).await;
            conn.close().await?;
        }
        if let Ok(mut guard) = self.supervisor.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.inner.set_status(ConnectionStatus::Closed);
        Ok(())
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.supervisor.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl Inner {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn establish(&self) -> Result<(Arc<Connection>, HandshakeInfo), ClientError> {
        let conn = Arc::new(Connection::new(self.config.clone(), self.events.clone()));
        let info = conn.connect().await?;
        *self.current.write().await = Some(conn.clone());
        *self.info.write().await = Some(info.clone());
        Ok((conn, info))
    }

    /// Runs connections back to back until closed or rejected for good.
    async fn supervise(self: Arc<Self>, mut conn: Arc<Connection>) {
        let mut restore_rooms = false;
        loop {
            let reader = conn.clone();
            let mut read_task = tokio::spawn(async move { reader.read_loop().await });
            if restore_rooms {
                self.rejoin(&conn).await;
            }
            self.set_status(ConnectionStatus::Connected);

            let interval = self
                .info
                .read()
                .await
                .as_ref()
                .map(HandshakeInfo::heartbeat_interval)
                .unwrap_or(Duration::from_secs(25));
            let reason = self
                .heartbeat_until_closed(&conn, interval, &mut read_task)
                .await;

            if self.is_closed() {
                return;
            }
            tracing::info!("Connection to {} lost: {}", self.config.addr, reason);
            *self.current.write().await = None;

            conn = match self.reconnect().await {
                Some(conn) => conn,
                None => return,
            };
            restore_rooms = true;
        }
    }

    /// Sends heartbeats until the read loop ends, returning why it ended.
    async fn heartbeat_until_closed(
        &self,
        conn: &Connection,
        interval: Duration,
        read_task: &mut JoinHandle<Result<(), ClientError>>,
    ) -> ClientError {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                joined = &mut *read_task => {
                    return match joined {
                        Ok(Err(e)) => e,
                        _ => ClientError::ConnectionClosed,
                    };
                }
                _ = ticker.tick() => {
                    if let Err(e) = conn.request("heartbeat", json!({})).await {
                        tracing::debug!("Heartbeat failed: {}", e);
                    }
                }
            }
        }
    }

    async fn reconnect(&self) -> Option<Arc<Connection>> {
        let mut attempt = 0;
        while self.policy.allows(attempt) {
            self.set_status(ConnectionStatus::Reconnecting {
                attempt: attempt + 1,
            });
            tokio::time::sleep(self.policy.delay(attempt)).await;
            if self.is_closed() {
                return None;
            }

            match self.establish().await {
                Ok((conn, _)) => {
                    tracing::info!(
                        "Reconnected to {} after {} attempts",
                        self.config.addr,
                        attempt + 1
                    );
                    return Some(conn);
                }
                Err(e) if e.is_fatal() => {
                    tracing::warn!("Gateway rejected reconnect: {}", e);
                    break;
                }
                Err(e) => {
                    tracing::debug!("Reconnect attempt {} failed: {}", attempt + 1, e);
                    attempt += 1;
                }
            }
        }
        self.set_status(ConnectionStatus::Closed);
        None
    }

    /// Restores room membership on a fresh connection.
    ///
    /// Rooms the gateway no longer lets us into are forgotten.
    async fn rejoin(&self, conn: &Connection) {
        let rooms: Vec<String> = self.rooms.lock().await.iter().cloned().collect();
        for room in rooms {
            match conn.request("join", json!({ "room": room })).await.map(into_result) {
                Ok(Ok(_)) => tracing::debug!("Re-joined {}", room),
                Ok(Err(e)) => {
                    tracing::warn!("Could not re-join {}: {}", room, e);
                    self.rooms.lock().await.remove(&room);
                }
                Err(e) => tracing::warn!("Could not re-join {}: {}", room, e),
            }
        }
    }
}

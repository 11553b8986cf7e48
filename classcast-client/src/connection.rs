//! Connection management.

use crate::error::ClientError;
use classcast_protocol::{
    Ack, Decoder, Handshake, Inbound, Outbound, ServerMessage, WireMode, PROTOCOL_VERSION,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Gateway address.
    pub addr: SocketAddr,
    /// Bearer credential presented in the handshake.
    pub token: String,
    /// Namespace to bind to, e.g. "/messaging".
    pub namespace: String,
    pub client_name: Option<String>,
    pub wire_mode: WireMode,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr, token: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            addr,
            token: token.into(),
            namespace: namespace.into(),
            client_name: None,
            wire_mode: WireMode::Binary,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_wire_mode(mut self, mode: WireMode) -> Self {
        self.wire_mode = mode;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// What the gateway reports about an accepted connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandshakeInfo {
    pub connection_id: String,
    pub namespace: String,
    pub user_id: String,
    pub role: String,
    pub heartbeat_interval_secs: u64,
    /// Rooms joined automatically.
    #[serde(default)]
    pub rooms: Vec<String>,
}

impl HandshakeInfo {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// One physical connection to a gateway.
///
/// Acks are matched to requests by id; events are published on the
/// broadcast channel handed to [`Connection::new`].
pub struct Connection {
    config: ConnectionConfig,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    decoder: Mutex<Decoder>,
    pending: Mutex<HashMap<String, oneshot::Sender<Ack>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    events: broadcast::Sender<Outbound>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig, events: broadcast::Sender<Outbound>) -> Self {
        let decoder = Decoder::with_mode(config.wire_mode);
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            decoder: Mutex::new(decoder),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            events,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects and performs the handshake.
    pub async fn connect(&self) -> Result<HandshakeInfo, ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        *self.decoder.lock().await = Decoder::with_mode(self.config.wire_mode);

        let info = self.handshake().await?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(
            "Bound to {} as {} (connection {})",
            info.namespace,
            info.user_id,
            info.connection_id
        );
        Ok(info)
    }

    /// Sends the handshake and reads its ack directly, before the read loop runs.
    async fn handshake(&self) -> Result<HandshakeInfo, ClientError> {
        let mut handshake = Handshake::new(&self.config.token, &self.config.namespace);
        handshake.client_name = self.config.client_name.clone();
        handshake.protocol_version = PROTOCOL_VERSION;
        self.write(&handshake).await?;

        let ack = self.read_single_ack().await?;
        let data = into_result(ack)?;
        Ok(serde_json::from_value(data)?)
    }

    async fn write<T: serde::Serialize>(&self, value: &T) -> Result<(), ClientError> {
        let encoded = self.config.wire_mode.encode(value)?;
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Reads a single ack with timeout. Used during the handshake.
    async fn read_single_ack(&self) -> Result<Ack, ClientError> {
        let buffer_size = self.config.read_buffer_size;

        tokio::time::timeout(self.config.request_timeout, async {
            let mut buf = vec![0u8; buffer_size];
            loop {
                if let Some(message) = self.decoder.lock().await.decode::<ServerMessage>()? {
                    match message {
                        ServerMessage::Ack(ack) => return Ok(ack),
                        ServerMessage::Event(event) => {
                            let _ = self.events.send(event);
                            continue;
                        }
                    }
                }

                let n = {
                    let mut reader_guard = self.reader.lock().await;
                    let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                    reader.read(&mut buf).await?
                };
                if n == 0 {
                    return Err(ClientError::ConnectionClosed);
                }
                self.decoder.lock().await.extend(&buf[..n]);
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)?
    }

    /// Sends a command and waits for its ack.
    pub async fn request(&self, command: &str, payload: Value) -> Result<Ack, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let inbound = Inbound::new(command, payload).with_id(&id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.write(&inbound).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        tracing::debug!("Request id={} command={} sent", id, command);

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Reads and dispatches acks and events until the connection ends.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        let result = loop {
            let n = {
                let mut reader_guard = self.reader.lock().await;
                let Some(reader) = reader_guard.as_mut() else {
                    break Err(ClientError::NotConnected);
                };
                match reader.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => break Err(ClientError::Io(e)),
                }
            };

            if n == 0 {
                tracing::debug!("read_loop: connection closed");
                break Err(ClientError::ConnectionClosed);
            }

            let mut decoder = self.decoder.lock().await;
            decoder.extend(&buf[..n]);
            loop {
                match decoder.decode::<ServerMessage>() {
                    Ok(Some(ServerMessage::Ack(ack))) => self.complete(ack).await,
                    Ok(Some(ServerMessage::Event(event))) => {
                        // No receivers is fine.
                        let _ = self.events.send(event);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("read_loop: undecodable message: {}", e);
                        self.connected.store(false, Ordering::SeqCst);
                        self.pending.lock().await.clear();
                        return Err(e.into());
                    }
                }
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().await.clear();
        result
    }

    async fn complete(&self, ack: Ack) {
        let Some(id) = ack.id.clone() else {
            tracing::debug!("read_loop: ack without id");
            return;
        };
        match self.pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(ack);
            }
            None => tracing::debug!("read_loop: no pending request for id={}", id),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection. Pending requests fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.pending.lock().await.clear();
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Turns an ack into its data or the server's error.
pub fn into_result(ack: Ack) -> Result<Value, ClientError> {
    match ack.error {
        Some(err) if !ack.success => Err(err.into()),
        _ => Ok(ack.data.unwrap_or(Value::Null)),
    }
}

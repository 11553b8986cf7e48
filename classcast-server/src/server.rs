//! TCP server implementation.

use crate::config::NetworkConfig;
use crate::error::ServerError;
use crate::handler::{ConnectionHandler, Outcome};
use crate::session::Session;
use classcast_protocol::{
    Ack, Decoder, ErrorCode, Handshake, Inbound, Outbound, ProtocolError, ServerMessage, WireMode,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// How often stale rate-limit windows are swept.
const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// The gateway's TCP front end.
pub struct Server {
    config: NetworkConfig,
    handler: Arc<ConnectionHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: NetworkConfig, handler: Arc<ConnectionHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    pub fn handler(&self) -> &Arc<ConnectionHandler> {
        &self.handler
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signals the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a receiver that fires on shutdown.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Binds the configured address and runs until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Runs on an already bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Gateway listening on {} (namespaces: {})",
            listener.local_addr()?,
            self.handler.manager().paths().join(", ")
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut sweep = tokio::time::interval(RATE_LIMIT_SWEEP_INTERVAL);
        sweep.tick().await;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let handler = self.handler.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    stream,
                                    addr,
                                    handler,
                                    config,
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.handler.sweep_rate_limits();
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Gateway shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Reads until the first message decodes. `None` means the peer went away.
    async fn read_handshake(
        stream: &mut TcpStream,
        decoder: &mut Decoder,
    ) -> Result<Option<Handshake>, ServerError> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(handshake) = decoder.decode::<Handshake>()? {
                return Ok(Some(handshake));
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            decoder.extend(&buf[..n]);
        }
    }

    async fn write_ack(
        stream: &mut TcpStream,
        mode: WireMode,
        ack: Ack,
    ) -> Result<(), ServerError> {
        let bytes = mode.encode(&ServerMessage::from(ack))?;
        stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Handles a single connection from handshake to cleanup.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<ConnectionHandler>,
        config: NetworkConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::debug!("Client connected: {}", addr);
        let _ = stream.set_nodelay(true);

        let mut session = Session::new(addr);
        let mut decoder = Decoder::new();

        let handshake = tokio::select! {
            result = tokio::time::timeout(
                config.handshake_timeout(),
                Self::read_handshake(&mut stream, &mut decoder),
            ) => match result {
                Ok(Ok(Some(handshake))) => handshake,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => {
                    let mode = decoder.mode().unwrap_or_default();
                    let ack = Ack::error(None, e.error_code(), e.client_message());
                    let _ = Self::write_ack(&mut stream, mode, ack).await;
                    return Err(e);
                }
                Err(_) => {
                    tracing::debug!(
                        "[{}] No handshake within {:?}",
                        addr,
                        config.handshake_timeout()
                    );
                    return Ok(());
                }
            },
            _ = shutdown.recv() => return Err(ServerError::ShuttingDown),
        };

        session.begin_authentication(
            decoder.mode().unwrap_or_default(),
            handshake.client_name.clone(),
        );
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(config.outbound_buffer.max(1));
        let ack = handler.handshake(&mut session, handshake, outbound_tx).await;
        Self::write_ack(&mut stream, session.wire_mode(), ack).await?;
        if !session.is_connected() {
            return Ok(());
        }

        let result = Self::serve(
            &mut stream,
            &mut session,
            &mut decoder,
            &handler,
            outbound_rx,
            shutdown,
        )
        .await;

        handler.disconnect(&mut session).await;
        let _ = stream.shutdown().await;
        result
    }

    /// The connected phase: events out, commands in, liveness checks.
    async fn serve(
        stream: &mut TcpStream,
        session: &mut Session,
        decoder: &mut Decoder,
        handler: &ConnectionHandler,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = session.remote_addr;
        let mode = session.wire_mode();
        let timeout = handler.heartbeat().timeout();
        let mut buf = [0u8; 8192];

        loop {
            let deadline = timeout.saturating_sub(session.idle_duration());

            tokio::select! {
                biased;

                Some(event) = outbound_rx.recv() => {
                    let bytes = mode.encode_push(&ServerMessage::from(event))?;
                    stream.write_all(&bytes).await?;
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", addr, n);
                            session.touch();
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(deadline) => {
                    if session.idle_duration() >= timeout {
                        tracing::info!(
                            "[{}] Heartbeat timeout after {:?}, disconnecting {}",
                            addr,
                            session.idle_duration(),
                            session.id
                        );
                        return Ok(());
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(ServerError::ShuttingDown);
                }
            }

            loop {
                // The decoder has consumed the message by the time its JSON
                // is parsed, so only framing errors leave the stream unusable.
                let raw = match decoder.decode::<Value>() {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(ProtocolError::Json(e)) => {
                        tracing::debug!("[{}] Unparseable message: {}", addr, e);
                        let ack = Ack::error(None, ErrorCode::BadRequest, e.to_string());
                        Self::write_ack(stream, mode, ack).await?;
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!("[{}] Malformed frame: {}", addr, e);
                        let ack = Ack::error(None, ErrorCode::BadRequest, e.to_string());
                        let _ = Self::write_ack(stream, mode, ack).await;
                        return Err(e.into());
                    }
                };
                let id = raw.get("id").and_then(Value::as_str).map(str::to_owned);
                let inbound = match serde_json::from_value::<Inbound>(raw) {
                    Ok(inbound) => inbound,
                    Err(e) => {
                        tracing::debug!("[{}] Invalid message shape: {}", addr, e);
                        let ack = Ack::error(
                            id,
                            ErrorCode::ValidationError,
                            format!("invalid message: {}", e),
                        );
                        Self::write_ack(stream, mode, ack).await?;
                        continue;
                    }
                };
                tracing::debug!(
                    "[{}] Command: {} (id={:?})",
                    addr,
                    inbound.command,
                    inbound.id
                );

                let (ack, outcome) = handler.handle(session, inbound).await;
                Self::write_ack(stream, mode, ack).await?;
                if outcome == Outcome::Close {
                    return Ok(());
                }
            }
        }
    }
}

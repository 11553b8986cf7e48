//! Coordination store daemon.
//!
//! Serves one [`MemoryStore`] to every gateway process over TCP using the
//! binary framing from `classcast-protocol`. Each peer connection runs its
//! own task; SUBSCRIBE spawns a forwarder that pushes channel publications
//! back to the peer between responses.

use crate::auth::PeerSecrets;
use crate::config::StoreDaemonConfig;
use crate::coordination::{ChannelReceiver, CoordinationStore, Expiration};
use crate::error::StoreError;
use crate::memory::MemoryStore;
use classcast_protocol::store::{
    ChannelParams, ExpireParams, HashFieldParams, HashSetParams, HelloParams, KeyParams,
    ListValueParams, Publication, PublishParams, SetMemberParams, StoreOp, StoreRequest,
    StoreResponse,
};
use classcast_protocol::{Decoder, Encoder, ErrorCode, WireMode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Daemon statistics.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Per-peer connection state.
struct Peer {
    addr: SocketAddr,
    authenticated: bool,
    client_name: Option<String>,
    last_activity: Instant,
    subscriptions: HashMap<String, JoinHandle<()>>,
}

impl Peer {
    fn new(addr: SocketAddr, auth_required: bool) -> Self {
        Self {
            addr,
            authenticated: !auth_required,
            client_name: None,
            last_activity: Instant::now(),
            subscriptions: HashMap::new(),
        }
    }

    fn drop_subscriptions(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.drop_subscriptions();
    }
}

pub struct StoreServer {
    config: StoreDaemonConfig,
    store: Arc<MemoryStore>,
    secrets: Arc<PeerSecrets>,
    stats: Arc<StoreStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl StoreServer {
    pub fn new(config: StoreDaemonConfig, store: Arc<MemoryStore>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let secrets = PeerSecrets::from_digests(config.peer_secret_digests.iter().cloned());
        Self {
            config,
            store,
            secrets: Arc::new(secrets),
            stats: Arc::new(StoreStats::default()),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), StoreError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serves on an already bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), StoreError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Coordination store listening on {} (peer auth {})",
            listener.local_addr()?,
            if self.secrets.is_enforced() {
                "enforced"
            } else {
                "disabled"
            }
        );

        let sweeper = self.store.spawn_sweeper(self.config.sweep_interval());
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                            continue;
                        }
                    };

                    if self.stats.connections_active.load(Ordering::Relaxed)
                        >= self.config.max_connections as u64
                    {
                        tracing::warn!("Peer limit reached, rejecting {}", addr);
                        continue;
                    }
                    self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                    self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                    let store = self.store.clone();
                    let secrets = self.secrets.clone();
                    let stats = self.stats.clone();
                    let idle_timeout = self.config.idle_timeout();
                    let mut peer_shutdown = self.shutdown.subscribe();

                    tokio::spawn(async move {
                        let result = Self::handle_connection(
                            stream,
                            addr,
                            store,
                            secrets,
                            stats.clone(),
                            idle_timeout,
                            &mut peer_shutdown,
                        )
                        .await;
                        if let Err(e) = result {
                            tracing::debug!("[{}] Peer error: {}", addr, e);
                            stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        }
                        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        tracing::info!("Peer disconnected: {}", addr);
                    });
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Coordination store shutting down");
                    break;
                }
            }
        }

        sweeper.abort();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        store: Arc<MemoryStore>,
        secrets: Arc<PeerSecrets>,
        stats: Arc<StoreStats>,
        idle_timeout: Option<Duration>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), StoreError> {
        tracing::info!("Peer connected: {}", addr);
        stream.set_nodelay(true)?;

        let mut peer = Peer::new(addr, secrets.is_enforced());
        let mut decoder = Decoder::with_mode(WireMode::Binary);
        let mut buf = [0u8; 8192];
        let (pub_tx, mut pub_rx) = mpsc::channel::<Publication>(1024);
        let idle_check = idle_timeout.unwrap_or(Duration::from_secs(3600));

        loop {
            tokio::select! {
                biased;

                Some(publication) = pub_rx.recv() => {
                    let bytes = Encoder::encode_push(&publication)?;
                    stream.write_all(&bytes).await?;
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by peer", addr);
                            return Ok(());
                        }
                        Ok(n) => decoder.extend(&buf[..n]),
                        Err(e) => return Err(StoreError::Io(e)),
                    }
                }

                _ = tokio::time::sleep(idle_check) => {
                    if idle_timeout.is_some() && peer.last_activity.elapsed() >= idle_check {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Ok(());
                }
            }

            while let Some(request) = decoder.decode::<StoreRequest>()? {
                peer.last_activity = Instant::now();
                stats.requests_total.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("[{}] {} (id={})", addr, request.op.as_str(), request.id);

                let response =
                    match Self::dispatch(&store, &secrets, &mut peer, &request, &pub_tx).await {
                        Ok(result) => StoreResponse::ok(request.id, result),
                        Err(e) => {
                            stats.errors_total.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                "[{}] {} failed: {}",
                                addr,
                                request.op.as_str(),
                                e
                            );
                            StoreResponse::error(request.id, e.error_code(), e.to_string())
                        }
                    };

                let bytes = Encoder::encode(&response)?;
                stream.write_all(&bytes).await?;
            }
        }
    }

    async fn dispatch(
        store: &MemoryStore,
        secrets: &PeerSecrets,
        peer: &mut Peer,
        request: &StoreRequest,
        pub_tx: &mpsc::Sender<Publication>,
    ) -> Result<Value, StoreError> {
        if request.op == StoreOp::Hello {
            return Self::hello(secrets, peer, &request.params);
        }
        if !peer.authenticated {
            return Err(StoreError::Rejected {
                code: ErrorCode::Unauthorized,
                message: "HELLO with a valid secret required".to_string(),
            });
        }

        match request.op {
            StoreOp::Hello => unreachable!("handled above"),
            StoreOp::Ping => Ok(json!({ "pong": true })),
            StoreOp::HashSet => {
                let p: HashSetParams = params(&request.params)?;
                let created = match expiration(p.ttl_ms, p.ttl_nx) {
                    Some(exp) => {
                        store
                            .set_hash_with_expiration(&p.key, &p.field, p.value, exp)
                            .await?
                    }
                    None => store.set_hash(&p.key, &p.field, p.value).await?,
                };
                Ok(json!({ "created": created }))
            }
            StoreOp::HashGet => {
                let p: HashFieldParams = params(&request.params)?;
                let value = store.get_hash(&p.key, &p.field).await?;
                Ok(json!({ "value": value }))
            }
            StoreOp::HashGetAll => {
                let p: KeyParams = params(&request.params)?;
                let fields = store.get_all_hash(&p.key).await?;
                Ok(json!({ "fields": fields }))
            }
            StoreOp::HashDelete => {
                let p: HashFieldParams = params(&request.params)?;
                let removed = store.delete_hash_field(&p.key, &p.field).await?;
                Ok(json!({ "removed": removed }))
            }
            StoreOp::SetAdd => {
                let p: SetMemberParams = params(&request.params)?;
                let added = match expiration(p.ttl_ms, p.ttl_nx) {
                    Some(exp) => {
                        store
                            .add_to_set_with_expiration(&p.key, &p.member, exp)
                            .await?
                    }
                    None => store.add_to_set(&p.key, &p.member).await?,
                };
                Ok(json!({ "added": added }))
            }
            StoreOp::SetIsMember => {
                let p: SetMemberParams = params(&request.params)?;
                let member = store.is_in_set(&p.key, &p.member).await?;
                Ok(json!({ "member": member }))
            }
            StoreOp::SetRemove => {
                let p: SetMemberParams = params(&request.params)?;
                let removed = store.remove_from_set(&p.key, &p.member).await?;
                Ok(json!({ "removed": removed }))
            }
            StoreOp::ListPush => {
                let p: ListValueParams = params(&request.params)?;
                let len = match expiration(p.ttl_ms, p.ttl_nx) {
                    Some(exp) => {
                        store
                            .push_to_list_with_expiration(&p.key, p.value, exp)
                            .await?
                    }
                    None => store.push_to_list(&p.key, p.value).await?,
                };
                Ok(json!({ "len": len }))
            }
            StoreOp::ListLength => {
                let p: KeyParams = params(&request.params)?;
                let len = store.list_len(&p.key).await?;
                Ok(json!({ "len": len }))
            }
            StoreOp::ListRange => {
                let p: KeyParams = params(&request.params)?;
                let values = store.get_list(&p.key).await?;
                Ok(json!({ "values": values }))
            }
            StoreOp::ListRemove => {
                let p: ListValueParams = params(&request.params)?;
                let removed = store.remove_from_list(&p.key, &p.value).await?;
                Ok(json!({ "removed": removed }))
            }
            StoreOp::Delete => {
                let p: KeyParams = params(&request.params)?;
                let removed = store.delete(&p.key).await?;
                Ok(json!({ "removed": removed }))
            }
            StoreOp::Expire | StoreOp::ExpireNx => {
                let p: ExpireParams = params(&request.params)?;
                let ttl = Duration::from_millis(p.ttl_ms);
                let applied = if request.op == StoreOp::Expire {
                    store.set_expiration(&p.key, ttl).await?
                } else {
                    store.set_expiration_if_absent(&p.key, ttl).await?
                };
                Ok(json!({ "applied": applied }))
            }
            StoreOp::Publish => {
                let p: PublishParams = params(&request.params)?;
                let receivers = store.publish(&p.channel, p.payload).await?;
                Ok(json!({ "receivers": receivers }))
            }
            StoreOp::Subscribe => {
                let p: ChannelParams = params(&request.params)?;
                if !peer.subscriptions.contains_key(&p.channel) {
                    let receiver = store.subscribe(&p.channel).await?;
                    let task = spawn_forwarder(
                        peer.addr,
                        p.channel.clone(),
                        receiver,
                        pub_tx.clone(),
                    );
                    peer.subscriptions.insert(p.channel.clone(), task);
                }
                Ok(json!({ "channel": p.channel, "subscribed": true }))
            }
            StoreOp::Unsubscribe => {
                let p: ChannelParams = params(&request.params)?;
                let removed = match peer.subscriptions.remove(&p.channel) {
                    Some(task) => {
                        task.abort();
                        true
                    }
                    None => false,
                };
                Ok(json!({ "channel": p.channel, "removed": removed }))
            }
        }
    }

    fn hello(secrets: &PeerSecrets, peer: &mut Peer, raw: &Value) -> Result<Value, StoreError> {
        let p: HelloParams = params(raw)?;
        if p.protocol_version != classcast_protocol::PROTOCOL_VERSION {
            return Err(StoreError::Rejected {
                code: ErrorCode::UnsupportedProtocol,
                message: format!("protocol version {} not supported", p.protocol_version),
            });
        }
        if secrets.is_enforced() {
            let valid = p.token.as_deref().is_some_and(|t| secrets.verify(t));
            if !valid {
                tracing::warn!("[{}] Peer presented an invalid secret", peer.addr);
                return Err(StoreError::Rejected {
                    code: ErrorCode::Unauthorized,
                    message: "invalid peer secret".to_string(),
                });
            }
        }
        peer.authenticated = true;
        peer.client_name = p.client_name;
        tracing::debug!(
            "[{}] HELLO from {}",
            peer.addr,
            peer.client_name.as_deref().unwrap_or("unnamed peer")
        );
        Ok(json!({
            "protocol_version": classcast_protocol::PROTOCOL_VERSION,
            "server": "classcast-store",
            "version": env!("CARGO_PKG_VERSION"),
        }))
    }

    /// Initiates shutdown of the accept loop and every peer connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }
}

fn params<T: DeserializeOwned>(raw: &Value) -> Result<T, StoreError> {
    serde_json::from_value(raw.clone()).map_err(|e| StoreError::InvalidParams(e.to_string()))
}

/// Expiration carried by a write, if any.
fn expiration(ttl_ms: Option<u64>, once: bool) -> Option<Expiration> {
    let ttl = Duration::from_millis(ttl_ms?);
    Some(if once {
        Expiration::Once(ttl)
    } else {
        Expiration::Refresh(ttl)
    })
}

fn spawn_forwarder(
    addr: SocketAddr,
    channel: String,
    mut receiver: ChannelReceiver,
    tx: mpsc::Sender<Publication>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(payload) => {
                    if tx.send(Publication::new(&channel, payload)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("[{}] Channel {} lagged {} messages", addr, channel, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use classcast_protocol::store::StoreServerMessage;

    async fn start(config: StoreDaemonConfig) -> (Arc<StoreServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(StoreServer::new(config, Arc::new(MemoryStore::new())));
        let runner = server.clone();
        tokio::spawn(async move { runner.run_with_listener(listener).await });
        (server, addr)
    }

    async fn roundtrip(
        stream: &mut TcpStream,
        decoder: &mut Decoder,
        request: StoreRequest,
    ) -> StoreResponse {
        stream
            .write_all(&Encoder::encode(&request).unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(msg) = decoder.decode::<StoreServerMessage>().unwrap() {
                if let Ok(resp) = msg.into_response() {
                    return resp;
                }
                continue;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "daemon closed the connection");
            decoder.extend(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_serves_hash_operations() {
        let (server, addr) = start(StoreDaemonConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::with_mode(WireMode::Binary);

        let resp = roundtrip(
            &mut stream,
            &mut decoder,
            StoreRequest::new(
                1,
                StoreOp::HashSet,
                json!({"key": "h", "field": "u1", "value": {"status": "online"}}),
            ),
        )
        .await;
        assert_eq!(resp.result.unwrap()["created"], true);

        let resp = roundtrip(
            &mut stream,
            &mut decoder,
            StoreRequest::new(2, StoreOp::HashGetAll, json!({"key": "h"})),
        )
        .await;
        assert_eq!(resp.id, 2);
        assert_eq!(resp.result.unwrap()["fields"]["u1"]["status"], "online");
        assert_eq!(server.store().len(), 1);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_bad_params_are_validation_errors() {
        let (server, addr) = start(StoreDaemonConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::with_mode(WireMode::Binary);

        let resp = roundtrip(
            &mut stream,
            &mut decoder,
            StoreRequest::new(5, StoreOp::ListPush, json!({"key": "l"})),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::ValidationError);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_enforced_secret() {
        let config = StoreDaemonConfig {
            peer_secret_digests: vec![crate::auth::digest("s3cret")],
            ..Default::default()
        };
        let (server, addr) = start(config).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::with_mode(WireMode::Binary);

        let resp = roundtrip(
            &mut stream,
            &mut decoder,
            StoreRequest::new(1, StoreOp::Ping, json!({})),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::Unauthorized);

        let resp = roundtrip(
            &mut stream,
            &mut decoder,
            StoreRequest::new(
                2,
                StoreOp::Hello,
                json!({"protocol_version": 1, "token": "wrong"}),
            ),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::Unauthorized);

        let resp = roundtrip(
            &mut stream,
            &mut decoder,
            StoreRequest::new(
                3,
                StoreOp::Hello,
                json!({"protocol_version": 1, "token": "s3cret"}),
            ),
        )
        .await;
        assert!(resp.is_ok());

        let resp = roundtrip(
            &mut stream,
            &mut decoder,
            StoreRequest::new(4, StoreOp::Ping, json!({})),
        )
        .await;
        assert_eq!(resp.result.unwrap()["pong"], true);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_subscription_pushes_publications() {
        let (server, addr) = start(StoreDaemonConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::with_mode(WireMode::Binary);

        let resp = roundtrip(
            &mut stream,
            &mut decoder,
            StoreRequest::new(1, StoreOp::Subscribe, json!({"channel": "fanout"})),
        )
        .await;
        assert!(resp.is_ok());

        let received = server
            .store()
            .publish("fanout", json!({"n": 42}))
            .await
            .unwrap();
        assert_eq!(received, 1);

        let mut buf = [0u8; 4096];
        let publication = loop {
            if let Some(msg) = decoder.decode::<StoreServerMessage>().unwrap() {
                if let Err(publication) = msg.into_response() {
                    break publication;
                }
                continue;
            }
            let n = stream.read(&mut buf).await.unwrap();
            decoder.extend(&buf[..n]);
        };
        assert_eq!(publication.channel, "fanout");
        assert_eq!(publication.payload["n"], 42);
        server.shutdown();
    }
}

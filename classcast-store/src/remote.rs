//! Client side of the coordination store daemon.
//!
//! [`RemoteStore`] keeps one multiplexed TCP connection to the daemon.
//! Requests are correlated by id; a background task reads responses and
//! channel publications. When the connection drops, in-flight calls fail
//! with [`StoreError::Unavailable`], new calls fail fast, and the task
//! reconnects with exponential backoff and restores every channel
//! subscription before marking the store usable again.

use crate::coordination::{ChannelReceiver, CoordinationStore, Expiration};
use crate::error::StoreError;
use async_trait::async_trait;
use classcast_protocol::store::{StoreOp, StoreRequest, StoreResponse, StoreServerMessage};
use classcast_protocol::{Decoder, Encoder, WireMode, PROTOCOL_VERSION};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Capacity of the local fan-out for each subscribed channel.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub addr: SocketAddr,
    pub connect_timeout: Duration,
    /// Upper bound on a single call, write and response included.
    pub call_timeout: Duration,
    pub client_name: Option<String>,
    /// Shared secret presented in HELLO.
    pub token: Option<String>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RemoteStoreConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(2),
            client_name: None,
            token: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }
}

struct Inner {
    config: RemoteStoreConfig,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<StoreResponse>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    channels: DashMap<String, broadcast::Sender<Value>>,
}

/// A [`CoordinationStore`] backed by the coordination store daemon.
pub struct RemoteStore {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteStore {
    /// Connects and completes the HELLO exchange.
    ///
    /// Fails if the daemon is unreachable or rejects the peer; after that,
    /// connection loss is handled in the background.
    pub async fn connect(config: RemoteStoreConfig) -> Result<Self, StoreError> {
        let inner = Arc::new(Inner {
            config,
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            channels: DashMap::new(),
        });

        let (reader, decoder) = inner.establish().await?;
        let supervisor = tokio::spawn(Inner::supervise(inner.clone(), reader, decoder));

        Ok(Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.config.addr
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Drops the local channel and tells the daemon to stop forwarding it.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        if self.inner.channels.remove(channel).is_some() && self.is_connected() {
            self.inner
                .call(StoreOp::Unsubscribe, json!({ "channel": channel }))
                .await?;
        }
        Ok(())
    }

    /// Closes the connection and stops reconnecting.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        self.inner.mark_disconnected().await;
        self.inner.channels.clear();
        tracing::debug!("Coordination store connection closed");
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
    }
}

impl Inner {
    /// Opens a connection, says HELLO and restores channel subscriptions.
    async fn establish(&self) -> Result<(OwnedReadHalf, Decoder), StoreError> {
        let addr = self.config.addr;
        tracing::debug!("Connecting to coordination store at {}", addr);

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| StoreError::Timeout(self.config.connect_timeout))?
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();

        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = Decoder::with_mode(WireMode::Binary);

        let hello = json!({
            "protocol_version": PROTOCOL_VERSION,
            "client_name": self.config.client_name,
            "token": self.config.token,
        });
        let response = self
            .exchange(&mut reader, &mut writer, &mut decoder, StoreOp::Hello, hello)
            .await?;
        into_result(response)?;

        let channels: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for channel in &channels {
            let response = self
                .exchange(
                    &mut reader,
                    &mut writer,
                    &mut decoder,
                    StoreOp::Subscribe,
                    json!({ "channel": channel }),
                )
                .await?;
            into_result(response)?;
        }
        if !channels.is_empty() {
            tracing::info!("Restored {} channel subscriptions", channels.len());
        }

        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!("Coordination store connected at {}", addr);
        Ok((reader, decoder))
    }

    /// Sends one request and reads until its response arrives. Used before
    /// the background reader owns the socket.
    async fn exchange(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        decoder: &mut Decoder,
        op: StoreOp,
        params: Value,
    ) -> Result<StoreResponse, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let encoded = Encoder::encode(&StoreRequest::new(id, op, params))?;
        writer.write_all(&encoded).await?;

        let timeout = self.config.call_timeout;
        tokio::time::timeout(timeout, self.read_response(reader, decoder, id))
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
    }

    async fn read_response(
        &self,
        reader: &mut OwnedReadHalf,
        decoder: &mut Decoder,
        id: u64,
    ) -> Result<StoreResponse, StoreError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            while let Some(msg) = decoder.decode::<StoreServerMessage>()? {
                match msg.into_response() {
                    Ok(response) if response.id == id => return Ok(response),
                    Ok(response) => {
                        tracing::debug!("Ignoring stale response id={}", response.id);
                    }
                    Err(publication) => self.deliver(&publication.channel, publication.payload),
                }
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(StoreError::Unavailable(
                    "connection closed during handshake".to_string(),
                ));
            }
            decoder.extend(&buf[..n]);
        }
    }

    /// Reads until the connection fails, then reconnects. Runs until closed.
    async fn supervise(self: Arc<Self>, mut reader: OwnedReadHalf, mut decoder: Decoder) {
        loop {
            let reason = self.read_loop(&mut reader, &mut decoder).await;
            self.mark_disconnected().await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            tracing::warn!("Lost coordination store connection: {}", reason);

            let mut backoff = self.config.initial_backoff;
            loop {
                tokio::time::sleep(backoff).await;
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                match self.establish().await {
                    Ok((r, d)) => {
                        reader = r;
                        decoder = d;
                        tracing::info!("Reconnected to coordination store");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("Reconnect failed, retrying in {:?}: {}", backoff, e);
                        backoff = (backoff * 2).min(self.config.max_backoff);
                    }
                }
            }
        }
    }

    async fn read_loop(&self, reader: &mut OwnedReadHalf, decoder: &mut Decoder) -> StoreError {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            loop {
                match decoder.decode::<StoreServerMessage>() {
                    Ok(Some(msg)) => self.dispatch(msg),
                    Ok(None) => break,
                    Err(e) => return StoreError::Protocol(e),
                }
            }
            match reader.read(&mut buf).await {
                Ok(0) => {
                    return StoreError::Unavailable("connection closed by store".to_string())
                }
                Ok(n) => decoder.extend(&buf[..n]),
                Err(e) => return StoreError::Io(e),
            }
        }
    }

    fn dispatch(&self, msg: StoreServerMessage) {
        match msg.into_response() {
            Ok(response) => {
                if let Some(tx) = self.pending.lock().remove(&response.id) {
                    let _ = tx.send(response);
                } else {
                    tracing::debug!("No pending call for response id={}", response.id);
                }
            }
            Err(publication) => self.deliver(&publication.channel, publication.payload),
        }
    }

    fn deliver(&self, channel: &str, payload: Value) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(payload);
        }
    }

    /// Marks the store unusable and fails every in-flight call.
    async fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let failed: Vec<_> = self.pending.lock().drain().collect();
        if !failed.is_empty() {
            tracing::debug!("Failing {} in-flight store calls", failed.len());
        }
    }

    async fn call(&self, op: StoreOp, params: Value) -> Result<Value, StoreError> {
        if self.closed.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("not connected".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let encoded = Encoder::encode(&StoreRequest::new(id, op, params))?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let timeout = self.config.call_timeout;
        let outcome = tokio::time::timeout(timeout, self.send_and_wait(&encoded, rx)).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.pending.lock().remove(&id);
                return Err(e);
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                tracing::debug!("{} (id={}) timed out", op.as_str(), id);
                return Err(StoreError::Timeout(timeout));
            }
        };

        into_result(response)
    }

    async fn send_and_wait(
        &self,
        encoded: &[u8],
        rx: oneshot::Receiver<StoreResponse>,
    ) -> Result<StoreResponse, StoreError> {
        {
            let mut guard = self.writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| StoreError::Unavailable("not connected".to_string()))?;
            writer.write_all(encoded).await?;
        }
        rx.await
            .map_err(|_| StoreError::Unavailable("connection lost".to_string()))
    }
}

fn into_result(response: StoreResponse) -> Result<Value, StoreError> {
    match response.error {
        Some(failure) => Err(StoreError::Rejected {
            code: failure.code,
            message: failure.message,
        }),
        None => Ok(response.result.unwrap_or(Value::Null)),
    }
}

fn flag(result: &Value, field: &str) -> bool {
    result[field].as_bool().unwrap_or(false)
}

fn count(result: &Value, field: &str) -> usize {
    result[field].as_u64().unwrap_or(0) as usize
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis() as u64
}

fn with_expiration(params: &mut Value, expiration: Expiration) {
    params["ttl_ms"] = json!(millis(expiration.ttl()));
    if expiration.is_once() {
        params["ttl_nx"] = json!(true);
    }
}

#[async_trait]
impl CoordinationStore for RemoteStore {
    async fn set_hash(&self, key: &str, field: &str, value: Value) -> Result<bool, StoreError> {
        let result = self
            .inner
            .call(
                StoreOp::HashSet,
                json!({ "key": key, "field": field, "value": value }),
            )
            .await?;
        Ok(flag(&result, "created"))
    }

    async fn set_hash_with_expiration(
        &self,
        key: &str,
        field: &str,
        value: Value,
        expiration: Expiration,
    ) -> Result<bool, StoreError> {
        let mut params = json!({ "key": key, "field": field, "value": value });
        with_expiration(&mut params, expiration);
        let result = self.inner.call(StoreOp::HashSet, params).await?;
        Ok(flag(&result, "created"))
    }

    async fn get_hash(&self, key: &str, field: &str) -> Result<Option<Value>, StoreError> {
        let mut result = self
            .inner
            .call(StoreOp::HashGet, json!({ "key": key, "field": field }))
            .await?;
        Ok(match result["value"].take() {
            Value::Null => None,
            value => Some(value),
        })
    }

    async fn get_all_hash(&self, key: &str) -> Result<HashMap<String, Value>, StoreError> {
        let mut result = self
            .inner
            .call(StoreOp::HashGetAll, json!({ "key": key }))
            .await?;
        match result["fields"].take() {
            Value::Null => Ok(HashMap::new()),
            fields => Ok(serde_json::from_value(fields)?),
        }
    }

    async fn delete_hash_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let result = self
            .inner
            .call(StoreOp::HashDelete, json!({ "key": key, "field": field }))
            .await?;
        Ok(flag(&result, "removed"))
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let result = self
            .inner
            .call(StoreOp::SetAdd, json!({ "key": key, "member": member }))
            .await?;
        Ok(flag(&result, "added"))
    }

    async fn add_to_set_with_expiration(
        &self,
        key: &str,
        member: &str,
        expiration: Expiration,
    ) -> Result<bool, StoreError> {
        let mut params = json!({ "key": key, "member": member });
        with_expiration(&mut params, expiration);
        let result = self.inner.call(StoreOp::SetAdd, params).await?;
        Ok(flag(&result, "added"))
    }

    async fn is_in_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let result = self
            .inner
            .call(StoreOp::SetIsMember, json!({ "key": key, "member": member }))
            .await?;
        Ok(flag(&result, "member"))
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let result = self
            .inner
            .call(StoreOp::SetRemove, json!({ "key": key, "member": member }))
            .await?;
        Ok(flag(&result, "removed"))
    }

    async fn push_to_list(&self, key: &str, value: Value) -> Result<usize, StoreError> {
        let result = self
            .inner
            .call(StoreOp::ListPush, json!({ "key": key, "value": value }))
            .await?;
        Ok(count(&result, "len"))
    }

    async fn push_to_list_with_expiration(
        &self,
        key: &str,
        value: Value,
        expiration: Expiration,
    ) -> Result<usize, StoreError> {
        let mut params = json!({ "key": key, "value": value });
        with_expiration(&mut params, expiration);
        let result = self.inner.call(StoreOp::ListPush, params).await?;
        Ok(count(&result, "len"))
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let result = self
            .inner
            .call(StoreOp::ListLength, json!({ "key": key }))
            .await?;
        Ok(count(&result, "len"))
    }

    async fn get_list(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        let mut result = self
            .inner
            .call(StoreOp::ListRange, json!({ "key": key }))
            .await?;
        match result["values"].take() {
            Value::Null => Ok(Vec::new()),
            values => Ok(serde_json::from_value(values)?),
        }
    }

    async fn remove_from_list(&self, key: &str, value: &Value) -> Result<usize, StoreError> {
        let result = self
            .inner
            .call(StoreOp::ListRemove, json!({ "key": key, "value": value }))
            .await?;
        Ok(count(&result, "removed"))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = self
            .inner
            .call(StoreOp::Delete, json!({ "key": key }))
            .await?;
        Ok(flag(&result, "removed"))
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let result = self
            .inner
            .call(
                StoreOp::Expire,
                json!({ "key": key, "ttl_ms": millis(ttl) }),
            )
            .await?;
        Ok(flag(&result, "applied"))
    }

    async fn set_expiration_if_absent(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = self
            .inner
            .call(
                StoreOp::ExpireNx,
                json!({ "key": key, "ttl_ms": millis(ttl) }),
            )
            .await?;
        Ok(flag(&result, "applied"))
    }

    async fn publish(&self, channel: &str, payload: Value) -> Result<usize, StoreError> {
        let result = self
            .inner
            .call(
                StoreOp::Publish,
                json!({ "channel": channel, "payload": payload }),
            )
            .await?;
        Ok(count(&result, "receivers"))
    }

    async fn subscribe(&self, channel: &str) -> Result<ChannelReceiver, StoreError> {
        let (receiver, first) = match self.inner.channels.entry(channel.to_string()) {
            Entry::Occupied(entry) => (entry.get().subscribe(), false),
            Entry::Vacant(entry) => {
                let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
                entry.insert(sender);
                (receiver, true)
            }
        };

        if first {
            if let Err(e) = self
                .inner
                .call(StoreOp::Subscribe, json!({ "channel": channel }))
                .await
            {
                self.inner.channels.remove(channel);
                return Err(e);
            }
        }
        Ok(receiver)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.call(StoreOp::Ping, json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreDaemonConfig;
    use crate::memory::MemoryStore;
    use crate::server::StoreServer;
    use classcast_protocol::ErrorCode;
    use tokio::net::TcpListener;

    async fn start_daemon(addr: &str, config: StoreDaemonConfig) -> (Arc<StoreServer>, SocketAddr) {
        let listener = TcpListener::bind(addr).await.unwrap();
        let local = listener.local_addr().unwrap();
        let server = Arc::new(StoreServer::new(config, Arc::new(MemoryStore::new())));
        let runner = server.clone();
        tokio::spawn(async move { runner.run_with_listener(listener).await });
        (server, local)
    }

    fn test_config(addr: SocketAddr) -> RemoteStoreConfig {
        RemoteStoreConfig::new(addr)
            .with_client_name("test-gateway")
            .with_backoff(Duration::from_millis(20), Duration::from_millis(100))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_operations_over_the_wire() {
        let (server, addr) = start_daemon("127.0.0.1:0", StoreDaemonConfig::default()).await;
        let store = RemoteStore::connect(test_config(addr)).await.unwrap();

        assert!(store.set_hash("h", "a", json!(1)).await.unwrap());
        assert!(!store.set_hash("h", "a", json!(2)).await.unwrap());
        assert_eq!(store.get_hash("h", "a").await.unwrap(), Some(json!(2)));
        assert_eq!(store.get_hash("h", "missing").await.unwrap(), None);
        assert_eq!(store.get_all_hash("h").await.unwrap().len(), 1);

        assert!(store.add_to_set("s", "m").await.unwrap());
        assert!(store.is_in_set("s", "m").await.unwrap());
        assert!(store.remove_from_set("s", "m").await.unwrap());

        assert_eq!(store.push_to_list("l", json!({"x": 1})).await.unwrap(), 1);
        assert_eq!(store.push_to_list("l", json!({"x": 2})).await.unwrap(), 2);
        assert_eq!(
            store.get_list("l").await.unwrap(),
            vec![json!({"x": 1}), json!({"x": 2})]
        );
        assert_eq!(store.remove_from_list("l", &json!({"x": 1})).await.unwrap(), 1);

        assert!(store.set_expiration("l", Duration::from_secs(60)).await.unwrap());
        assert!(!store
            .set_expiration_if_absent("l", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(server.store().ttl("l").unwrap() > Duration::from_secs(30));

        assert!(store.delete("h").await.unwrap());
        assert!(store.get_all_hash("h").await.unwrap().is_empty());
        store.ping().await.unwrap();

        server.shutdown();
    }

    #[tokio::test]
    async fn test_writes_carry_expiration_over_the_wire() {
        let (server, addr) = start_daemon("127.0.0.1:0", StoreDaemonConfig::default()).await;
        let store = RemoteStore::connect(test_config(addr)).await.unwrap();
        let ttl = Duration::from_secs(60);
        let refresh = Expiration::Refresh(ttl);

        store
            .set_hash_with_expiration("presence", "u1", json!({"status": "online"}), refresh)
            .await
            .unwrap();
        store
            .add_to_set_with_expiration("raised", "u1", refresh)
            .await
            .unwrap();
        store
            .push_to_list_with_expiration("hands", json!("u1"), refresh)
            .await
            .unwrap();
        store.push_to_list("plain", json!(1)).await.unwrap();

        // A once-only expiration leaves an existing one alone.
        store
            .push_to_list_with_expiration("hands", json!("u2"), Expiration::Once(ttl * 10))
            .await
            .unwrap();

        for key in ["presence", "raised", "hands"] {
            let left = server.store().ttl(key).unwrap();
            assert!(left > Duration::from_secs(30) && left <= ttl, "{}", key);
        }
        assert_eq!(server.store().ttl("plain"), None);
        assert_eq!(store.list_len("hands").await.unwrap(), 2);
        assert_eq!(store.list_len("nothing").await.unwrap(), 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let (server, addr) = start_daemon("127.0.0.1:0", StoreDaemonConfig::default()).await;
        let store = RemoteStore::connect(test_config(addr)).await.unwrap();

        store.push_to_list("k", json!(1)).await.unwrap();
        let err = store.set_hash("k", "f", json!(1)).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ValidationError);
        assert!(!err.is_unavailable());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_publications_reach_other_peers() {
        let (server, addr) = start_daemon("127.0.0.1:0", StoreDaemonConfig::default()).await;
        let a = RemoteStore::connect(test_config(addr)).await.unwrap();
        let b = RemoteStore::connect(test_config(addr)).await.unwrap();

        let mut rx = b.subscribe("fanout").await.unwrap();
        let mut second = b.subscribe("fanout").await.unwrap();
        assert_eq!(a.publish("fanout", json!({"hello": "world"})).await.unwrap(), 1);

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, json!({"hello": "world"}));
        assert_eq!(second.recv().await.unwrap(), json!({"hello": "world"}));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_rejected_secret_fails_connect() {
        let config = StoreDaemonConfig {
            peer_secret_digests: vec![crate::auth::digest("right")],
            ..Default::default()
        };
        let (server, addr) = start_daemon("127.0.0.1:0", config).await;

        let err = RemoteStore::connect(test_config(addr).with_token("wrong"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.error_code(), ErrorCode::Unauthorized);

        let store = RemoteStore::connect(test_config(addr).with_token("right"))
            .await
            .unwrap();
        store.ping().await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = RemoteStore::connect(test_config(addr)).await.err().unwrap();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_reconnects_and_restores_subscriptions() {
        let (server, addr) = start_daemon("127.0.0.1:0", StoreDaemonConfig::default()).await;
        let store = RemoteStore::connect(test_config(addr)).await.unwrap();
        let mut rx = store.subscribe("fanout").await.unwrap();

        server.shutdown();
        wait_until(|| !store.is_connected() && !server.is_running()).await;

        let err = store.ping().await.unwrap_err();
        assert!(err.is_unavailable());

        let (restarted, _) =
            start_daemon(&addr.to_string(), StoreDaemonConfig::default()).await;
        wait_until(|| store.is_connected()).await;

        store.ping().await.unwrap();
        restarted
            .store()
            .publish("fanout", json!("after-restart"))
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, json!("after-restart"));

        store.close().await;
        assert!(!store.is_connected());
        restarted.shutdown();
    }
}

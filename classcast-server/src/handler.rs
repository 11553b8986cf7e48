//! Connection handler.
//!
//! Drives one connection through its lifecycle: handshake, commands and
//! disconnect cleanup. Built-in commands (`join`, `leave`, `heartbeat`,
//! `disconnect`, `emit`) are handled here; everything else is delegated to
//! the connection's namespace.

use crate::auth::{Authenticator, Role};
use crate::config::{HeartbeatConfig, RateLimitsConfig};
use crate::error::ServerError;
use crate::manager::NamespaceManager;
use crate::metrics::{Metrics, NO_NAMESPACE};
use crate::namespace::{payload_room, require_str, CommandContext, NamespaceHandler};
use crate::rate_limit::{RateDecision, RateLimit, RateLimiter};
use crate::registry::ConnectionRegistry;
use crate::room::Room;
use crate::session::Session;
use classcast_protocol::{Ack, Handshake, Inbound, Outbound, PROTOCOL_VERSION};
use futures::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What the connection loop does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Close,
}

pub struct ConnectionHandler {
    manager: Arc<NamespaceManager>,
    authenticator: Authenticator,
    limiter: RateLimiter,
    rate_limits: RateLimitsConfig,
    heartbeat: HeartbeatConfig,
    metrics: Arc<Metrics>,
}

impl ConnectionHandler {
    pub fn new(
        manager: Arc<NamespaceManager>,
        authenticator: Authenticator,
        rate_limits: RateLimitsConfig,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        let metrics = manager.broadcaster().metrics().clone();
        Self {
            manager,
            authenticator,
            limiter: RateLimiter::new(),
            rate_limits,
            heartbeat,
            metrics,
        }
    }

    pub fn manager(&self) -> &Arc<NamespaceManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.manager.broadcaster().registry()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn heartbeat(&self) -> &HeartbeatConfig {
        &self.heartbeat
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Validates the handshake and binds the session.
    ///
    /// On failure the session is left disconnected and the returned ack
    /// carries the error; the caller closes the connection.
    pub async fn handshake(
        &self,
        session: &mut Session,
        handshake: Handshake,
        sender: mpsc::Sender<Outbound>,
    ) -> Ack {
        match self.try_handshake(session, handshake, sender).await {
            Ok(data) => Ack::ok(None, data),
            Err(e) => {
                tracing::info!(
                    "[{}] Handshake rejected: {}",
                    session.remote_addr,
                    e
                );
                self.metrics
                    .record_error(NO_NAMESPACE, e.error_code().as_str());
                self.registry().unregister(session.id);
                session.mark_disconnected();
                Ack::error(None, e.error_code(), e.client_message())
            }
        }
    }

    async fn try_handshake(
        &self,
        session: &mut Session,
        handshake: Handshake,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<Value, ServerError> {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::UnsupportedProtocol(handshake.protocol_version));
        }
        let identity = self.authenticator.authenticate(&handshake.token)?;
        let namespace = self
            .manager
            .get(&handshake.namespace)
            .ok_or_else(|| ServerError::NotFound(format!("namespace {}", handshake.namespace)))?;

        let path = namespace.path();
        session.complete_handshake(path, identity.clone());
        self.registry()
            .register(session.id, path, &identity.user_id, sender);

        let auto_rooms = {
            let ctx = CommandContext {
                connection_id: session.id,
                namespace: path,
                identity: &identity,
                rooms: session.rooms(),
            };
            namespace.on_connect(&ctx).await?
        };
        for room in auto_rooms {
            self.registry().join(session.id, &room);
            session.add_room(room);
        }

        self.metrics.connection_opened(path);
        tracing::info!(
            "[{}] Connection {} bound to {} as {} ({})",
            session.remote_addr,
            session.id,
            path,
            identity.user_id,
            identity.role
        );

        let mut rooms: Vec<String> = session.rooms().iter().map(Room::to_string).collect();
        rooms.sort();
        Ok(json!({
            "connection_id": session.id,
            "namespace": path,
            "user_id": identity.user_id,
            "role": identity.role,
            "heartbeat_interval_secs": self.heartbeat.interval_secs,
            "rooms": rooms,
        }))
    }

    fn limit_for(&self, namespace: &dyn NamespaceHandler, command: &str) -> RateLimit {
        self.rate_limits
            .override_for(namespace.path(), command)
            .or_else(|| namespace.rate_limit(command))
            .unwrap_or(self.rate_limits.default)
    }

    /// Runs one inbound command and builds its ack.
    pub async fn handle(&self, session: &mut Session, inbound: Inbound) -> (Ack, Outcome) {
        session.touch();
        session.record_command();
        let namespace_label = session.namespace().unwrap_or(NO_NAMESPACE).to_string();
        let started = Instant::now();

        self.metrics
            .events_total
            .with_label_values(&[&namespace_label, &inbound.command])
            .inc();

        let result = AssertUnwindSafe(self.dispatch(session, &inbound))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ServerError::Internal(format!("handler panicked: {}", reason)))
            });

        self.metrics
            .command_duration
            .with_label_values(&[&namespace_label, &inbound.command])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok((data, outcome)) => (Ack::ok(inbound.id, data), outcome),
            Err(e) => {
                let code = e.error_code();
                self.metrics.record_error(&namespace_label, code.as_str());
                let user = session
                    .identity()
                    .map(|i| i.user_id.as_str())
                    .unwrap_or("-");
                if code == classcast_protocol::ErrorCode::InternalError {
                    tracing::error!(
                        "[{}] Command '{}' failed (connection={}, namespace={}, user={}): {}",
                        session.remote_addr,
                        inbound.command,
                        session.id,
                        namespace_label,
                        user,
                        e
                    );
                } else {
                    tracing::debug!(
                        "[{}] Command '{}' rejected for {}: {}",
                        session.remote_addr,
                        inbound.command,
                        user,
                        e
                    );
                }
                (
                    Ack::error(inbound.id, code, e.client_message()),
                    Outcome::Continue,
                )
            }
        }
    }

    async fn dispatch(
        &self,
        session: &mut Session,
        inbound: &Inbound,
    ) -> Result<(Value, Outcome), ServerError> {
        if !session.is_connected() {
            return Err(ServerError::unauthorized("handshake required"));
        }
        let path = session.namespace().unwrap_or_default().to_string();
        let namespace = self
            .manager
            .get(&path)
            .ok_or_else(|| ServerError::NotFound(format!("namespace {}", path)))?;
        let command = inbound.command.as_str();

        if command != "disconnect" {
            let limit = self.limit_for(namespace.as_ref(), command);
            if let RateDecision::Limited { retry_after } =
                self.limiter.check(session.id, command, limit)
            {
                return Err(ServerError::RateLimited {
                    command: command.to_string(),
                    retry_after_ms: retry_after.as_millis() as u64,
                });
            }
        }

        let payload = &inbound.payload;
        let data = match command {
            "join" => self.join(session, namespace.as_ref(), payload).await?,
            "leave" => self.leave(session, namespace.as_ref(), payload).await?,
            "heartbeat" => {
                namespace.on_heartbeat(&context(session)?).await?;
                json!({
                    "heartbeat_interval_secs": self.heartbeat.interval_secs,
                    "server_time": chrono::Utc::now(),
                })
            }
            "disconnect" => return Ok((json!({ "disconnected": true }), Outcome::Close)),
            "emit" => self.emit(session, namespace.as_ref(), payload).await?,
            _ => {
                namespace
                    .handle_command(&context(session)?, command, payload)
                    .await?
            }
        };
        Ok((data, Outcome::Continue))
    }

    /// Authorizes and joins a room, returning the namespace's hydration data.
    async fn join(
        &self,
        session: &mut Session,
        namespace: &dyn NamespaceHandler,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let room = payload_room(payload)?;
        if !namespace.allows_scope(room.scope()) {
            return Err(ServerError::validation(format!(
                "{} does not serve {} rooms",
                namespace.path(),
                room.scope()
            )));
        }
        let identity = session
            .identity()
            .ok_or_else(|| ServerError::unauthorized("handshake required"))?;
        namespace.can_access_room(identity, &room).await?;

        let newly_joined = session.add_room(room.clone());
        self.registry().join(session.id, &room);

        let hydration = namespace.on_join(&context(session)?, &room).await;
        match hydration {
            Ok(state) => {
                tracing::debug!("Connection {} joined {}", session.id, room);
                Ok(json!({ "room": room, "joined": newly_joined, "state": state }))
            }
            Err(e) => {
                if newly_joined {
                    session.remove_room(&room);
                    self.registry().leave(session.id, &room);
                }
                Err(e)
            }
        }
    }

    async fn leave(
        &self,
        session: &mut Session,
        namespace: &dyn NamespaceHandler,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let room = payload_room(payload)?;
        if !session.remove_room(&room) {
            return Ok(json!({ "room": room, "left": false }));
        }
        self.registry().leave(session.id, &room);
        if let Err(e) = namespace.on_leave(&context(session)?, &room).await {
            tracing::warn!(
                "Cleanup after {} left {} failed: {}",
                session.id,
                room,
                e
            );
        }
        Ok(json!({ "room": room, "left": true }))
    }

    /// Broadcast on behalf of out-of-process business logic.
    async fn emit(
        &self,
        session: &mut Session,
        namespace: &dyn NamespaceHandler,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let identity = session
            .identity()
            .ok_or_else(|| ServerError::unauthorized("handshake required"))?;
        if identity.role != Role::Service {
            return Err(ServerError::unauthorized("emit requires a service identity"));
        }
        let room = payload_room(payload)?;
        let event = require_str(payload, "event")?;
        let body = payload.get("payload").cloned().unwrap_or_else(|| json!({}));
        if !namespace.allows_scope(room.scope()) {
            return Err(ServerError::validation(format!(
                "{} does not serve {} rooms",
                namespace.path(),
                room.scope()
            )));
        }
        namespace.can_access_room(identity, &room).await?;

        let delivery = self
            .manager
            .broadcaster()
            .to_room(namespace.path(), &room, event, body, None)
            .await;
        Ok(json!({ "room": room, "event": event, "delivered": delivery.delivered }))
    }

    /// Releases everything a connection holds. Safe to call more than once.
    pub async fn disconnect(&self, session: &mut Session) {
        let rooms = session.take_rooms();
        let path = session.namespace().map(str::to_string);
        if let (Some(path), true) = (path, session.is_connected()) {
            if let Some(namespace) = self.manager.get(&path) {
                if let Ok(ctx) = context(session) {
                    for room in &rooms {
                        if let Err(e) = namespace.on_leave(&ctx, room).await {
                            tracing::warn!(
                                "Cleanup of {} for {} failed: {}",
                                room,
                                session.id,
                                e
                            );
                        }
                    }
                }
            }
            self.metrics.connection_closed(&path);
            tracing::info!(
                "[{}] Connection {} left {} after {:?} ({} commands)",
                session.remote_addr,
                session.id,
                path,
                session.age(),
                session.command_count()
            );
        }
        self.registry().unregister(session.id);
        self.limiter.forget_connection(session.id);
        session.mark_disconnected();
    }

    /// Drops rate-limit windows older than the longest configured window.
    pub fn sweep_rate_limits(&self) {
        let longest = self
            .rate_limits
            .commands
            .values()
            .chain(std::iter::once(&self.rate_limits.default))
            .map(RateLimit::window)
            .max()
            .unwrap_or(Duration::from_secs(60));
        self.limiter.cleanup(longest.max(Duration::from_secs(3600)));
    }
}

fn context(session: &Session) -> Result<CommandContext<'_>, ServerError> {
    let identity = session
        .identity()
        .ok_or_else(|| ServerError::unauthorized("handshake required"))?;
    Ok(CommandContext {
        connection_id: session.id,
        namespace: session.namespace().unwrap_or_default(),
        identity,
        rooms: session.rooms(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{MemoryDirectory, ResourceRecord};
    use crate::auth::{Identity, TenantPath};
    use crate::config::{DeploymentMode, TtlConfig};
    use crate::fanout::LocalFanout;
    use crate::manager::Broadcaster;
    use crate::namespace::testing::room;
    use crate::namespace::{standard_namespaces, Services};
    use crate::room::Scope;
    use async_trait::async_trait;
    use classcast_protocol::{ErrorCode, WireMode};
    use classcast_store::MemoryStore;

    const SECRET: &[u8] = b"handler-test-secret";

    struct Fixture {
        handler: ConnectionHandler,
        directory: Arc<MemoryDirectory>,
        store: Arc<MemoryStore>,
        auth: Authenticator,
    }

    /// Panics on every command.
    struct Exploding {
        services: Services,
    }

    #[async_trait]
    impl NamespaceHandler for Exploding {
        fn path(&self) -> &'static str {
            "/boom"
        }
        fn scopes(&self) -> &'static [Scope] {
            &[Scope::User]
        }
        fn services(&self) -> &Services {
            &self.services
        }
        async fn handle_command(
            &self,
            _ctx: &CommandContext<'_>,
            _command: &str,
            _payload: &Value,
        ) -> Result<Value, ServerError> {
            panic!("kaboom");
        }
    }

    fn fixture(rate_limits: RateLimitsConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(
            "gw",
            registry,
            Arc::new(LocalFanout::default()),
            Arc::new(Metrics::new().unwrap()),
        ));
        let services = Services::new(
            store.clone(),
            directory.clone(),
            broadcaster.clone(),
            TtlConfig::default(),
        );
        let manager = Arc::new(NamespaceManager::new(broadcaster, DeploymentMode::Single));
        for ns in standard_namespaces(&services) {
            manager.register(ns);
        }
        manager.register(Arc::new(Exploding { services }));

        let auth = Authenticator::new(SECRET, None, 0);
        Fixture {
            handler: ConnectionHandler::new(
                manager,
                Authenticator::new(SECRET, None, 0),
                rate_limits,
                HeartbeatConfig::default(),
            ),
            directory,
            store,
            auth,
        }
    }

    fn token(fx: &Fixture, user: &str, role: Role) -> String {
        let identity = Identity::new(user, role, TenantPath::new("acme"));
        fx.auth.issue(&identity, Duration::from_secs(600)).unwrap()
    }

    async fn connect(
        fx: &Fixture,
        namespace: &str,
        user: &str,
        role: Role,
    ) -> (Session, mpsc::Receiver<Outbound>) {
        let mut session = Session::new("127.0.0.1:40000".parse().unwrap());
        session.begin_authentication(WireMode::Jsonl, None);
        let (tx, rx) = mpsc::channel(32);
        let ack = fx
            .handler
            .handshake(&mut session, Handshake::new(token(fx, user, role), namespace), tx)
            .await;
        assert!(ack.success, "handshake failed: {:?}", ack.error);
        (session, rx)
    }

    async fn send(fx: &Fixture, session: &mut Session, command: &str, payload: Value) -> Ack {
        fx.handler
            .handle(session, Inbound::new(command, payload).with_id("1"))
            .await
            .0
    }

    #[tokio::test]
    async fn test_handshake_ack_and_auto_rooms() {
        let fx = fixture(RateLimitsConfig::default());
        let mut session = Session::new("127.0.0.1:40000".parse().unwrap());
        let (tx, _rx) = mpsc::channel(4);
        let ack = fx
            .handler
            .handshake(
                &mut session,
                Handshake::new(token(&fx, "s1", Role::Student), "/gradebook"),
                tx,
            )
            .await;
        let data = ack.data.unwrap();
        assert_eq!(data["namespace"], "/gradebook");
        assert_eq!(data["user_id"], "s1");
        assert_eq!(data["role"], "student");
        assert_eq!(data["heartbeat_interval_secs"], 25);
        assert_eq!(data["rooms"], json!(["user:s1"]));
        assert_eq!(data["connection_id"], session.id.to_string());
        assert_eq!(fx.handler.registry().room_size("/gradebook", &room("user:s1")), 1);
    }

    #[tokio::test]
    async fn test_handshake_failures() {
        let fx = fixture(RateLimitsConfig::default());
        let cases = [
            (Handshake::new("garbage", "/gradebook"), ErrorCode::Unauthorized),
            (
                Handshake::new(token(&fx, "u", Role::Student), "/nope"),
                ErrorCode::NotFound,
            ),
            (
                Handshake {
                    protocol_version: 99,
                    ..Handshake::new(token(&fx, "u", Role::Student), "/gradebook")
                },
                ErrorCode::UnsupportedProtocol,
            ),
        ];
        for (handshake, expected) in cases {
            let mut session = Session::new("127.0.0.1:40000".parse().unwrap());
            let (tx, _rx) = mpsc::channel(4);
            let ack = fx.handler.handshake(&mut session, handshake, tx).await;
            assert_eq!(ack.error_code(), Some(expected));
            assert!(!session.is_connected());
        }
        assert_eq!(fx.handler.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_join_reauthorizes_every_time() {
        let fx = fixture(RateLimitsConfig::default());
        let class = room("class:c1");
        fx.directory
            .insert(class.clone(), ResourceRecord::new("acme").with_member("s1"));
        let (mut session, _rx) = connect(&fx, "/gradebook", "s1", Role::Student).await;

        let ack = send(&fx, &mut session, "join", json!({"room": "class:c1"})).await;
        assert!(ack.success);
        send(&fx, &mut session, "leave", json!({"room": "class:c1"})).await;

        fx.directory.revoke(&class, "s1");
        let ack = send(&fx, &mut session, "join", json!({"room": "class:c1"})).await;
        assert_eq!(ack.error_code(), Some(ErrorCode::Unauthorized));
        assert!(!session.is_in_room(&class));
        assert_eq!(fx.handler.registry().room_size("/gradebook", &class), 0);
    }

    #[tokio::test]
    async fn test_join_rejects_foreign_scope() {
        let fx = fixture(RateLimitsConfig::default());
        let (mut session, _rx) = connect(&fx, "/attendance", "t1", Role::Teacher).await;
        let ack = send(&fx, &mut session, "join", json!({"room": "session:s1"})).await;
        assert_eq!(ack.error_code(), Some(ErrorCode::ValidationError));
        let ack = send(&fx, &mut session, "join", json!({"room": "bogus"})).await;
        assert_eq!(ack.error_code(), Some(ErrorCode::ValidationError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_then_reset() {
        let mut limits = RateLimitsConfig::default();
        limits
            .commands
            .insert("/messaging:roster".into(), RateLimit::new(3, 10));
        let fx = fixture(limits);
        fx.directory.insert(
            room("conversation:k"),
            ResourceRecord::new("acme").with_member("u1"),
        );
        let (mut session, _rx) = connect(&fx, "/messaging", "u1", Role::Student).await;
        send(&fx, &mut session, "join", json!({"room": "conversation:k"})).await;

        for _ in 0..3 {
            let ack = send(&fx, &mut session, "roster", json!({"room": "conversation:k"})).await;
            assert!(ack.success);
        }
        let limited = send(&fx, &mut session, "roster", json!({"room": "conversation:k"})).await;
        assert_eq!(limited.error_code(), Some(ErrorCode::RateLimited));
        assert!(limited.error.unwrap().retryable);

        tokio::time::advance(Duration::from_secs(10)).await;
        let ack = send(&fx, &mut session, "roster", json!({"room": "conversation:k"})).await;
        assert!(ack.success);
    }

    #[tokio::test]
    async fn test_unknown_command_and_disconnect() {
        let fx = fixture(RateLimitsConfig::default());
        let (mut session, _rx) = connect(&fx, "/gradebook", "s1", Role::Student).await;

        let ack = send(&fx, &mut session, "fly", json!({})).await;
        assert_eq!(ack.error_code(), Some(ErrorCode::ValidationError));
        assert_eq!(ack.id.as_deref(), Some("1"));

        let (ack, outcome) = fx
            .handler
            .handle(&mut session, Inbound::new("disconnect", json!({})))
            .await;
        assert!(ack.success);
        assert_eq!(outcome, Outcome::Close);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let fx = fixture(RateLimitsConfig::default());
        let (mut session, _rx) = connect(&fx, "/boom", "u1", Role::Student).await;

        let (ack, outcome) = fx
            .handler
            .handle(&mut session, Inbound::new("anything", json!({})))
            .await;
        assert_eq!(ack.error_code(), Some(ErrorCode::InternalError));
        assert_eq!(ack.error.unwrap().message, "internal error");
        assert_eq!(outcome, Outcome::Continue);

        let ack = send(&fx, &mut session, "heartbeat", json!({})).await;
        assert!(ack.success);
    }

    #[tokio::test]
    async fn test_emit_is_service_only() {
        let fx = fixture(RateLimitsConfig::default());
        fx.directory
            .insert(room("class:c1"), ResourceRecord::new("acme").with_member("s1"));
        let (mut student, _rx) = connect(&fx, "/gradebook", "s1", Role::Student).await;
        let (mut service, _srx) = connect(&fx, "/gradebook", "sis", Role::Service).await;
        let (mut listener, mut events) = connect(&fx, "/gradebook", "s1", Role::Student).await;
        send(&fx, &mut listener, "join", json!({"room": "class:c1"})).await;

        let emit = json!({"room": "class:c1", "event": "grade_posted", "payload": {"score": 88}});
        let denied = send(&fx, &mut student, "emit", emit.clone()).await;
        assert_eq!(denied.error_code(), Some(ErrorCode::Unauthorized));

        let ack = send(&fx, &mut service, "emit", emit).await;
        assert_eq!(ack.data.unwrap()["delivered"], 1);
        let event = events.recv().await.unwrap();
        assert_eq!(event.event, "grade_posted");
        assert_eq!(event.payload, json!({"score": 88}));
    }

    #[tokio::test]
    async fn test_disconnect_runs_cleanup() {
        let fx = fixture(RateLimitsConfig::default());
        fx.directory.insert(
            room("session:s1"),
            ResourceRecord::new("acme").with_member("a"),
        );
        let (mut session, _rx) = connect(&fx, "/live", "a", Role::Student).await;
        send(&fx, &mut session, "join", json!({"room": "session:s1"})).await;
        let ack = send(&fx, &mut session, "raise_hand", json!({"room": "session:s1"})).await;
        assert!(ack.success);
        assert!(!fx.store.is_empty());

        fx.handler.disconnect(&mut session).await;
        assert!(fx.store.is_empty());
        assert_eq!(fx.handler.registry().connection_count(), 0);
        assert!(fx.handler.rate_limiter().is_empty());

        // Second call is a no-op.
        fx.handler.disconnect(&mut session).await;
    }
}

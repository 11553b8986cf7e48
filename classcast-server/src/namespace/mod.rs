//! Namespace handlers.
//!
//! A namespace is the feature a connection binds to at handshake. Each one
//! declares the room scopes it serves, its per-command rate limits and the
//! commands it understands beyond the built-ins handled by the connection
//! handler (`join`, `leave`, `heartbeat`, `disconnect`, `emit`).
//!
//! Stateless namespaces only relay broadcasts. Stateful ones keep ephemeral
//! shared state in the coordination store under their own key prefix, and
//! every key they write carries an expiration.

mod assessment;
mod attendance;
mod gradebook;
mod live_session;
mod messaging;
mod notifications;

pub use assessment::AssessmentNamespace;
pub use attendance::AttendanceNamespace;
pub use gradebook::GradebookNamespace;
pub use live_session::LiveSessionNamespace;
pub use messaging::MessagingNamespace;
pub use notifications::NotificationsNamespace;

use crate::access::{self, AccessDirectory};
use crate::auth::Identity;
use crate::config::TtlConfig;
use crate::error::ServerError;
use crate::manager::Broadcaster;
use crate::rate_limit::RateLimit;
use crate::room::{Room, Scope};
use crate::session::ConnectionId;
use async_trait::async_trait;
use classcast_store::CoordinationStore;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Process-wide collaborators shared by every namespace.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn CoordinationStore>,
    pub directory: Arc<dyn AccessDirectory>,
    pub broadcaster: Arc<Broadcaster>,
    pub ttl: TtlConfig,
}

impl Services {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        directory: Arc<dyn AccessDirectory>,
        broadcaster: Arc<Broadcaster>,
        ttl: TtlConfig,
    ) -> Self {
        Self {
            store,
            directory,
            broadcaster,
            ttl,
        }
    }
}

/// The connection a hook or command runs for.
pub struct CommandContext<'a> {
    pub connection_id: ConnectionId,
    pub namespace: &'a str,
    pub identity: &'a Identity,
    /// Rooms joined so far.
    pub rooms: &'a HashSet<Room>,
}

impl<'a> CommandContext<'a> {
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn require_staff(&self) -> Result<(), ServerError> {
        if self.identity.is_staff() {
            Ok(())
        } else {
            Err(ServerError::unauthorized("staff only"))
        }
    }

    pub fn require_joined(&self, room: &Room) -> Result<(), ServerError> {
        if self.rooms.contains(room) {
            Ok(())
        } else {
            Err(ServerError::unauthorized(format!("not joined to {}", room)))
        }
    }

    /// Reads the `room` field, checks its scope and that it has been joined.
    pub fn joined_room(&self, payload: &Value, scope: Scope) -> Result<Room, ServerError> {
        let room = payload_room(payload)?;
        if room.scope() != scope {
            return Err(ServerError::validation(format!(
                "expected a {} room, got {}",
                scope, room
            )));
        }
        self.require_joined(&room)?;
        Ok(room)
    }

    /// Joined rooms of one scope.
    pub fn rooms_of(&self, scope: Scope) -> impl Iterator<Item = &Room> + '_ {
        self.rooms.iter().filter(move |r| r.scope() == scope)
    }
}

#[async_trait]
pub trait NamespaceHandler: Send + Sync {
    /// Path clients name in the handshake, e.g. `/messaging`.
    fn path(&self) -> &'static str;

    /// Room scopes this namespace serves.
    fn scopes(&self) -> &'static [Scope];

    fn services(&self) -> &Services;

    fn allows_scope(&self, scope: Scope) -> bool {
        self.scopes().contains(&scope)
    }

    /// Namespace default for a command. Config overrides take precedence.
    fn rate_limit(&self, _command: &str) -> Option<RateLimit> {
        None
    }

    /// Re-evaluated against the directory on every join.
    async fn can_access_room(&self, identity: &Identity, room: &Room) -> Result<(), ServerError> {
        access::authorize(self.services().directory.as_ref(), identity, room).await
    }

    /// Private rooms joined automatically after the handshake.
    async fn on_connect(&self, _ctx: &CommandContext<'_>) -> Result<Vec<Room>, ServerError> {
        Ok(Vec::new())
    }

    /// Runs after a successful join; the result is returned in the join ack.
    async fn on_join(&self, _ctx: &CommandContext<'_>, _room: &Room) -> Result<Value, ServerError> {
        Ok(json!({}))
    }

    /// Runs on leave, and for every joined room on disconnect.
    async fn on_leave(&self, _ctx: &CommandContext<'_>, _room: &Room) -> Result<(), ServerError> {
        Ok(())
    }

    async fn on_heartbeat(&self, _ctx: &CommandContext<'_>) -> Result<(), ServerError> {
        Ok(())
    }

    async fn handle_command(
        &self,
        _ctx: &CommandContext<'_>,
        command: &str,
        _payload: &Value,
    ) -> Result<Value, ServerError> {
        Err(unknown_command(command))
    }
}

pub fn unknown_command(command: &str) -> ServerError {
    ServerError::validation(format!("unknown command '{}'", command))
}

/// Returns a required string field.
pub fn require_str<'v>(payload: &'v Value, field: &str) -> Result<&'v str, ServerError> {
    match payload.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(_) => Err(ServerError::validation(format!(
            "'{}' must be a non-empty string",
            field
        ))),
        None => Err(ServerError::validation(format!("'{}' is required", field))),
    }
}

pub fn require_u64(payload: &Value, field: &str) -> Result<u64, ServerError> {
    payload
        .get(field)
        .ok_or_else(|| ServerError::validation(format!("'{}' is required", field)))?
        .as_u64()
        .ok_or_else(|| {
            ServerError::validation(format!("'{}' must be a non-negative integer", field))
        })
}

pub fn payload_room(payload: &Value) -> Result<Room, ServerError> {
    require_str(payload, "room")?.parse()
}

/// The connection's own `user:{id}` room.
pub fn own_room(ctx: &CommandContext<'_>) -> Result<Room, ServerError> {
    Room::user(ctx.user_id())
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Builds the standard set of namespaces.
pub fn standard_namespaces(services: &Services) -> Vec<Arc<dyn NamespaceHandler>> {
    vec![
        Arc::new(GradebookNamespace::new(services.clone())),
        Arc::new(AttendanceNamespace::new(services.clone())),
        Arc::new(NotificationsNamespace::new(services.clone())),
        Arc::new(MessagingNamespace::new(services.clone())),
        Arc::new(LiveSessionNamespace::new(services.clone())),
        Arc::new(AssessmentNamespace::new(services.clone())),
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the namespace tests.

    use super::*;
    use crate::access::{MemoryDirectory, ResourceRecord};
    use crate::auth::{Role, TenantPath};
    use crate::fanout::LocalFanout;
    use crate::metrics::Metrics;
    use crate::registry::ConnectionRegistry;
    use classcast_protocol::Outbound;
    use classcast_store::{ChannelReceiver, Expiration, MemoryStore, StoreError};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub directory: Arc<MemoryDirectory>,
        pub registry: Arc<ConnectionRegistry>,
        pub services: Services,
    }

    impl Harness {
        pub fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let directory = Arc::new(MemoryDirectory::new());
            let registry = Arc::new(ConnectionRegistry::new());
            let broadcaster = Arc::new(Broadcaster::new(
                "test",
                registry.clone(),
                Arc::new(LocalFanout::default()),
                Arc::new(Metrics::new().unwrap()),
            ));
            let services = Services::new(
                store.clone(),
                directory.clone(),
                broadcaster,
                TtlConfig::default(),
            );
            Self {
                store,
                directory,
                registry,
                services,
            }
        }

        pub fn with_resource(self, room: &str, record: ResourceRecord) -> Self {
            self.directory.insert(room.parse().unwrap(), record);
            self
        }

        /// Registers a listening connection joined to `rooms`.
        pub fn listener(&self, namespace: &str, rooms: &[&str]) -> mpsc::Receiver<Outbound> {
            let (tx, rx) = mpsc::channel(64);
            let id = Uuid::new_v4();
            self.registry.register(id, namespace, "listener", tx);
            for room in rooms {
                self.registry.join(id, &room.parse().unwrap());
            }
            rx
        }
    }

    pub struct Conn {
        pub id: ConnectionId,
        pub namespace: &'static str,
        pub identity: Identity,
        pub rooms: HashSet<Room>,
    }

    impl Conn {
        pub fn new(namespace: &'static str, user: &str, role: Role) -> Self {
            Self {
                id: Uuid::new_v4(),
                namespace,
                identity: Identity::new(user, role, TenantPath::new("acme")),
                rooms: HashSet::new(),
            }
        }

        pub fn joined(mut self, room: &str) -> Self {
            self.rooms.insert(room.parse().unwrap());
            self
        }

        pub fn ctx(&self) -> CommandContext<'_> {
            CommandContext {
                connection_id: self.id,
                namespace: self.namespace,
                identity: &self.identity,
                rooms: &self.rooms,
            }
        }
    }

    pub fn room(name: &str) -> Room {
        name.parse().unwrap()
    }

    /// Store double that goes down after a number of successful calls.
    pub struct FlakyStore {
        inner: Arc<MemoryStore>,
        budget: AtomicUsize,
    }

    impl FlakyStore {
        pub fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                budget: AtomicUsize::new(usize::MAX),
            }
        }

        /// Lets `calls` more calls through, then fails everything.
        pub fn fail_after(&self, calls: usize) {
            self.budget.store(calls, Ordering::SeqCst);
        }

        pub fn recover(&self) {
            self.budget.store(usize::MAX, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            self.budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    if n == usize::MAX {
                        Some(n)
                    } else {
                        n.checked_sub(1)
                    }
                })
                .map(|_| ())
                .map_err(|_| StoreError::Unavailable("connection reset".into()))
        }
    }

    #[async_trait]
    impl CoordinationStore for FlakyStore {
        async fn set_hash(&self, key: &str, field: &str, value: Value) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.set_hash(key, field, value).await
        }

        async fn set_hash_with_expiration(
            &self,
            key: &str,
            field: &str,
            value: Value,
            expiration: Expiration,
        ) -> Result<bool, StoreError> {
            self.check()?;
            self.inner
                .set_hash_with_expiration(key, field, value, expiration)
                .await
        }

        async fn get_hash(&self, key: &str, field: &str) -> Result<Option<Value>, StoreError> {
            self.check()?;
            self.inner.get_hash(key, field).await
        }

        async fn get_all_hash(&self, key: &str) -> Result<HashMap<String, Value>, StoreError> {
            self.check()?;
            self.inner.get_all_hash(key).await
        }

        async fn delete_hash_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.delete_hash_field(key, field).await
        }

        async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.add_to_set(key, member).await
        }

        async fn add_to_set_with_expiration(
            &self,
            key: &str,
            member: &str,
            expiration: Expiration,
        ) -> Result<bool, StoreError> {
            self.check()?;
            self.inner
                .add_to_set_with_expiration(key, member, expiration)
                .await
        }

        async fn is_in_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.is_in_set(key, member).await
        }

        async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.remove_from_set(key, member).await
        }

        async fn push_to_list(&self, key: &str, value: Value) -> Result<usize, StoreError> {
            self.check()?;
            self.inner.push_to_list(key, value).await
        }

        async fn push_to_list_with_expiration(
            &self,
            key: &str,
            value: Value,
            expiration: Expiration,
        ) -> Result<usize, StoreError> {
            self.check()?;
            self.inner
                .push_to_list_with_expiration(key, value, expiration)
                .await
        }

        async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
            self.check()?;
            self.inner.list_len(key).await
        }

        async fn get_list(&self, key: &str) -> Result<Vec<Value>, StoreError> {
            self.check()?;
            self.inner.get_list(key).await
        }

        async fn remove_from_list(&self, key: &str, value: &Value) -> Result<usize, StoreError> {
            self.check()?;
            self.inner.remove_from_list(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.delete(key).await
        }

        async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.set_expiration(key, ttl).await
        }

        async fn set_expiration_if_absent(
            &self,
            key: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.set_expiration_if_absent(key, ttl).await
        }

        async fn publish(&self, channel: &str, payload: Value) -> Result<usize, StoreError> {
            self.check()?;
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<ChannelReceiver, StoreError> {
            self.check()?;
            self.inner.subscribe(channel).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.check()?;
            self.inner.ping().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::auth::Role;

    #[test]
    fn test_payload_helpers() {
        let payload = json!({"room": "class:c1", "n": 3, "empty": ""});
        assert_eq!(payload_room(&payload).unwrap(), room("class:c1"));
        assert_eq!(require_u64(&payload, "n").unwrap(), 3);
        assert!(require_str(&payload, "empty").is_err());
        assert!(require_str(&payload, "missing").is_err());
        assert!(require_u64(&json!({"n": -1}), "n").is_err());
        assert!(payload_room(&json!({"room": "nope"})).is_err());
    }

    #[test]
    fn test_joined_room_checks_scope_and_membership() {
        let conn = Conn::new("/messaging", "u1", Role::Student).joined("conversation:x");
        let ctx = conn.ctx();

        assert!(ctx
            .joined_room(&json!({"room": "conversation:x"}), Scope::Conversation)
            .is_ok());
        let err = ctx
            .joined_room(&json!({"room": "conversation:y"}), Scope::Conversation)
            .unwrap_err();
        assert_eq!(err.error_code(), classcast_protocol::ErrorCode::Unauthorized);
        let err = ctx
            .joined_room(&json!({"room": "conversation:x"}), Scope::Session)
            .unwrap_err();
        assert_eq!(
            err.error_code(),
            classcast_protocol::ErrorCode::ValidationError
        );
    }

    #[test]
    fn test_standard_namespaces_have_distinct_paths() {
        let harness = Harness::new();
        let paths: HashSet<_> = standard_namespaces(&harness.services)
            .iter()
            .map(|ns| ns.path())
            .collect();
        assert_eq!(paths.len(), 6);
        assert!(paths.contains("/live"));
    }
}

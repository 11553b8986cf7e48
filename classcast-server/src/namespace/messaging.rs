//! `/messaging`: typing indicators, presence and read receipts.
//!
//! Message delivery itself comes from business logic through
//! `NamespaceManager::message_created`. This namespace keeps the transient
//! signals around a conversation:
//!
//! - `messaging:typing:{room}` holds one field per typing user with
//!   `{display_name, updated_at}`. Every keystroke rewrites the field and
//!   resets the key TTL in one store call. Readers drop fields older than the
//!   typing TTL.
//! - `messaging:presence:{room}` holds one field per user with
//!   `{status, display_name, last_seen}`. The key TTL is refreshed by
//!   heartbeats, and the roster drops fields older than the TTL.

use super::{
    now_millis, own_room, require_str, unknown_command, CommandContext, NamespaceHandler,
    Services,
};
use crate::error::ServerError;
use crate::rate_limit::RateLimit;
use crate::room::{Room, Scope};
use async_trait::async_trait;
use classcast_store::Expiration;
use serde_json::{json, Value};

fn typing_key(room: &Room) -> String {
    format!("messaging:typing:{}", room)
}

fn presence_key(room: &Room) -> String {
    format!("messaging:presence:{}", room)
}

pub struct MessagingNamespace {
    services: Services,
}

impl MessagingNamespace {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn set_typing(
        &self,
        ctx: &CommandContext<'_>,
        room: &Room,
        typing: bool,
    ) -> Result<(), ServerError> {
        let store = &self.services.store;
        let key = typing_key(room);
        if typing {
            store
                .set_hash_with_expiration(
                    &key,
                    ctx.user_id(),
                    json!({
                        "display_name": ctx.identity.display_name,
                        "updated_at": now_millis(),
                    }),
                    Expiration::Refresh(self.services.ttl.typing()),
                )
                .await?;
        } else {
            store.delete_hash_field(&key, ctx.user_id()).await?;
        }
        self.services
            .broadcaster
            .to_room(
                ctx.namespace,
                room,
                "typing",
                json!({
                    "room": room,
                    "user_id": ctx.user_id(),
                    "display_name": ctx.identity.display_name,
                    "typing": typing,
                }),
                Some(ctx.connection_id),
            )
            .await;
        Ok(())
    }

    /// Writes this user's presence field and refreshes the key TTL.
    async fn touch_presence(
        &self,
        ctx: &CommandContext<'_>,
        room: &Room,
    ) -> Result<(), ServerError> {
        self.services
            .store
            .set_hash_with_expiration(
                &presence_key(room),
                ctx.user_id(),
                json!({
                    "status": "online",
                    "display_name": ctx.identity.display_name,
                    "last_seen": now_millis(),
                }),
                Expiration::Refresh(self.services.ttl.presence()),
            )
            .await?;
        Ok(())
    }

    async fn announce_presence(&self, ctx: &CommandContext<'_>, room: &Room, status: &str) {
        self.services
            .broadcaster
            .to_room(
                ctx.namespace,
                room,
                "presence",
                json!({
                    "room": room,
                    "user_id": ctx.user_id(),
                    "status": status,
                }),
                Some(ctx.connection_id),
            )
            .await;
    }

    /// Users seen in the room within the presence TTL, ordered by id.
    pub async fn roster(&self, room: &Room) -> Result<Vec<Value>, ServerError> {
        self.fresh_fields(&presence_key(room), "last_seen", self.services.ttl.presence())
            .await
    }

    /// Users who typed in the room within the typing TTL, ordered by id.
    pub async fn typists(&self, room: &Room) -> Result<Vec<Value>, ServerError> {
        self.fresh_fields(&typing_key(room), "updated_at", self.services.ttl.typing())
            .await
    }

    /// Per-user fields whose `stamp` falls within `ttl`, tagged with `user_id`.
    async fn fresh_fields(
        &self,
        key: &str,
        stamp: &str,
        ttl: std::time::Duration,
    ) -> Result<Vec<Value>, ServerError> {
        let fields = self.services.store.get_all_hash(key).await?;
        let cutoff = now_millis() - ttl.as_millis() as i64;

        let mut users: Vec<(String, Value)> = fields
            .into_iter()
            .filter(|(_, entry)| {
                entry
                    .get(stamp)
                    .and_then(Value::as_i64)
                    .is_some_and(|at| at >= cutoff)
            })
            .collect();
        users.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(users
            .into_iter()
            .map(|(user_id, mut entry)| {
                if let Value::Object(ref mut map) = entry {
                    map.insert("user_id".to_string(), Value::String(user_id));
                }
                entry
            })
            .collect())
    }

    async fn mark_read(
        &self,
        ctx: &CommandContext<'_>,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let room = ctx.joined_room(payload, Scope::Conversation)?;
        let message_id = require_str(payload, "message_id")?;
        self.services
            .broadcaster
            .to_room(
                ctx.namespace,
                &room,
                "read_receipt",
                json!({
                    "room": room,
                    "user_id": ctx.user_id(),
                    "message_id": message_id,
                    "read_at": now_millis(),
                }),
                Some(ctx.connection_id),
            )
            .await;
        Ok(json!({ "room": room, "message_id": message_id }))
    }
}

#[async_trait]
impl NamespaceHandler for MessagingNamespace {
    fn path(&self) -> &'static str {
        "/messaging"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::Conversation, Scope::User]
    }

    fn services(&self) -> &Services {
        &self.services
    }

    fn rate_limit(&self, command: &str) -> Option<RateLimit> {
        match command {
            "typing_start" | "typing_stop" => Some(RateLimit::new(30, 10)),
            "roster" => Some(RateLimit::new(30, 60)),
            "mark_read" => Some(RateLimit::new(120, 60)),
            _ => None,
        }
    }

    async fn on_connect(&self, ctx: &CommandContext<'_>) -> Result<Vec<Room>, ServerError> {
        Ok(vec![own_room(ctx)?])
    }

    async fn on_join(&self, ctx: &CommandContext<'_>, room: &Room) -> Result<Value, ServerError> {
        if room.scope() != Scope::Conversation {
            return Ok(json!({}));
        }
        self.touch_presence(ctx, room).await?;
        self.announce_presence(ctx, room, "online").await;
        Ok(json!({
            "roster": self.roster(room).await?,
            "typing": self.typists(room).await?,
        }))
    }

    async fn on_leave(&self, ctx: &CommandContext<'_>, room: &Room) -> Result<(), ServerError> {
        if room.scope() != Scope::Conversation {
            return Ok(());
        }
        let store = &self.services.store;
        let was_typing = store
            .delete_hash_field(&typing_key(room), ctx.user_id())
            .await?;
        store
            .delete_hash_field(&presence_key(room), ctx.user_id())
            .await?;
        if was_typing {
            self.services
                .broadcaster
                .to_room(
                    ctx.namespace,
                    room,
                    "typing",
                    json!({"room": room, "user_id": ctx.user_id(), "typing": false}),
                    Some(ctx.connection_id),
                )
                .await;
        }
        self.announce_presence(ctx, room, "offline").await;
        Ok(())
    }

    async fn on_heartbeat(&self, ctx: &CommandContext<'_>) -> Result<(), ServerError> {
        for room in ctx.rooms_of(Scope::Conversation) {
            self.touch_presence(ctx, room).await?;
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        ctx: &CommandContext<'_>,
        command: &str,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        match command {
            "typing_start" | "typing_stop" => {
                let room = ctx.joined_room(payload, Scope::Conversation)?;
                let typing = command == "typing_start";
                self.set_typing(ctx, &room, typing).await?;
                Ok(json!({ "room": room, "typing": typing }))
            }
            "roster" => {
                let room = ctx.joined_room(payload, Scope::Conversation)?;
                Ok(json!({ "room": room, "users": self.roster(&room).await? }))
            }
            "mark_read" => self.mark_read(ctx, payload).await,
            _ => Err(unknown_command(command)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::namespace::testing::{room, Conn, FlakyStore, Harness};
    use classcast_protocol::ErrorCode;
    use classcast_store::CoordinationStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn convo(user: &str) -> Conn {
        Conn::new("/messaging", user, Role::Student).joined("conversation:k")
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_expires_after_ttl() {
        let harness = Harness::new();
        let ns = MessagingNamespace::new(harness.services.clone());
        let mut peer = harness.listener("/messaging", &["conversation:k"]);
        let conn = convo("u1");

        ns.handle_command(&conn.ctx(), "typing_start", &json!({"room": "conversation:k"}))
            .await
            .unwrap();
        let event = peer.recv().await.unwrap();
        assert_eq!(event.event, "typing");
        assert_eq!(event.payload["typing"], true);

        let key = typing_key(&room("conversation:k"));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(harness.store.get_hash(&key, "u1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(harness.store.get_hash(&key, "u1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystroke_refreshes_typing_ttl() {
        let harness = Harness::new();
        let ns = MessagingNamespace::new(harness.services.clone());
        let conn = convo("u1");
        let payload = json!({"room": "conversation:k"});
        let key = typing_key(&room("conversation:k"));

        ns.handle_command(&conn.ctx(), "typing_start", &payload)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        ns.handle_command(&conn.ctx(), "typing_start", &payload)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(harness.store.get_hash(&key, "u1").await.unwrap().is_some());

        ns.handle_command(&conn.ctx(), "typing_stop", &payload)
            .await
            .unwrap();
        assert!(harness.store.get_hash(&key, "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_typing_requires_join() {
        let ns = MessagingNamespace::new(Harness::new().services);
        let conn = Conn::new("/messaging", "u1", Role::Student);
        let err = ns
            .handle_command(&conn.ctx(), "typing_start", &json!({"room": "conversation:k"}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Unauthorized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_never_leaves_entries_without_expiry() {
        let harness = Harness::new();
        let flaky = Arc::new(FlakyStore::new(harness.store.clone()));
        let services = Services {
            store: flaky.clone(),
            ..harness.services.clone()
        };
        let ns = MessagingNamespace::new(services);
        let conn = convo("u1");
        let k = room("conversation:k");
        let payload = json!({"room": "conversation:k"});

        // The write lands, then the store drops before presence is read back.
        flaky.fail_after(1);
        let err = ns.on_join(&conn.ctx(), &k).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::StoreUnavailable);
        assert_eq!(
            harness.store.ttl(&presence_key(&k)),
            Some(Duration::from_secs(300))
        );

        flaky.fail_after(0);
        let err = ns
            .handle_command(&conn.ctx(), "typing_start", &payload)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(harness.store.get_all_hash(&typing_key(&k)).await.unwrap().is_empty());

        flaky.recover();
        ns.handle_command(&conn.ctx(), "typing_start", &payload)
            .await
            .unwrap();
        assert_eq!(
            harness.store.ttl(&typing_key(&k)),
            Some(Duration::from_secs(5))
        );

        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        harness.store.purge_expired();
        assert!(harness.store.is_empty());
    }

    #[tokio::test]
    async fn test_join_hydrates_typists_from_shared_state() {
        let harness = Harness::new();
        // Two gateway processes sharing one store.
        let here = MessagingNamespace::new(harness.services.clone());
        let there = MessagingNamespace::new(harness.services.clone());
        let k = room("conversation:k");

        let payload = json!({"room": "conversation:k"});
        there
            .handle_command(&convo("bob").ctx(), "typing_start", &payload)
            .await
            .unwrap();
        harness
            .store
            .set_hash_with_expiration(
                &typing_key(&k),
                "idle",
                json!({"display_name": "idle", "updated_at": now_millis() - 60_000}),
                Expiration::Refresh(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        let hydration = here.on_join(&convo("alice").ctx(), &k).await.unwrap();
        let typing = hydration["typing"].as_array().unwrap();
        assert_eq!(typing.len(), 1);
        assert_eq!(typing[0]["user_id"], "bob");

        there.on_leave(&convo("bob").ctx(), &k).await.unwrap();
        assert!(here.typists(&k).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presence_roster_and_leave() {
        let harness = Harness::new();
        let ns = MessagingNamespace::new(harness.services.clone());
        let a = convo("alice");
        let b = convo("bob");
        let k = room("conversation:k");

        ns.on_join(&a.ctx(), &k).await.unwrap();
        let hydration = ns.on_join(&b.ctx(), &k).await.unwrap();
        let users: Vec<_> = hydration["roster"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["user_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(users, vec!["alice", "bob"]);

        ns.on_leave(&a.ctx(), &k).await.unwrap();
        let roster = ns
            .handle_command(&b.ctx(), "roster", &json!({"room": "conversation:k"}))
            .await
            .unwrap();
        assert_eq!(roster["users"].as_array().unwrap().len(), 1);
        assert_eq!(roster["users"][0]["user_id"], "bob");
    }

    #[tokio::test]
    async fn test_roster_filters_stale_entries() {
        let harness = Harness::new();
        let ns = MessagingNamespace::new(harness.services.clone());
        let k = room("conversation:k");
        let stale = now_millis() - 10 * 60 * 1000;
        harness
            .store
            .set_hash(
                &presence_key(&k),
                "ghost",
                json!({"status": "online", "last_seen": stale}),
            )
            .await
            .unwrap();
        ns.on_join(&convo("live").ctx(), &k).await.unwrap();

        let roster = ns.roster(&k).await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0]["user_id"], "live");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_refreshes_presence_ttl() {
        let harness = Harness::new();
        let ns = MessagingNamespace::new(harness.services.clone());
        let conn = convo("u1");
        let key = presence_key(&room("conversation:k"));

        ns.on_join(&conn.ctx(), &room("conversation:k")).await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        ns.on_heartbeat(&conn.ctx()).await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(harness.store.get_hash(&key, "u1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(101)).await;
        assert!(harness.store.get_hash(&key, "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_read_broadcasts_receipt() {
        let harness = Harness::new();
        let ns = MessagingNamespace::new(harness.services.clone());
        let mut peer = harness.listener("/messaging", &["conversation:k"]);

        ns.handle_command(
            &convo("u1").ctx(),
            "mark_read",
            &json!({"room": "conversation:k", "message_id": "m-42"}),
        )
        .await
        .unwrap();
        let receipt = peer.recv().await.unwrap();
        assert_eq!(receipt.event, "read_receipt");
        assert_eq!(receipt.payload["message_id"], "m-42");
        assert_eq!(receipt.payload["user_id"], "u1");
    }
}

//! `/live`: collaborative class sessions.
//!
//! Keys live under `live:{session}` and every write refreshes the session TTL:
//!
//! | Key | Structure | Contents |
//! |---|---|---|
//! | `live:{s}:hands` | list | raise order, head first |
//! | `live:{s}:hands:raised` | set | users currently in the queue |
//! | `live:{s}:polls` | hash | poll id -> definition |
//! | `live:{s}:poll:{p}:votes` | hash | user -> option index |
//! | `live:{s}:strokes` | list | whiteboard strokes in draw order |
//!
//! The raised set guards the queue: a user is appended only when adding them
//! to the set reports a new member, so concurrent raises never duplicate.
//!
//! The whiteboard holds at most [`MAX_STROKES`] strokes of at most
//! [`MAX_STROKE_BYTES`] each; a full board must be cleared by staff.

use super::{
    now_millis, require_str, require_u64, unknown_command, CommandContext, NamespaceHandler,
    Services,
};
use crate::error::ServerError;
use crate::rate_limit::RateLimit;
use crate::room::{Room, Scope};
use async_trait::async_trait;
use classcast_store::Expiration;
use serde_json::{json, Value};

const MAX_POLL_OPTIONS: usize = 10;

/// Strokes kept per session whiteboard.
pub const MAX_STROKES: usize = 2_000;

/// Serialized size limit of a single stroke.
pub const MAX_STROKE_BYTES: usize = 16 * 1024;

struct Keys {
    prefix: String,
}

impl Keys {
    fn new(room: &Room) -> Self {
        Self {
            prefix: format!("live:{}", room.id()),
        }
    }

    fn hands(&self) -> String {
        format!("{}:hands", self.prefix)
    }

    fn raised(&self) -> String {
        format!("{}:hands:raised", self.prefix)
    }

    fn polls(&self) -> String {
        format!("{}:polls", self.prefix)
    }

    fn votes(&self, poll_id: &str) -> String {
        format!("{}:poll:{}:votes", self.prefix, poll_id)
    }

    fn strokes(&self) -> String {
        format!("{}:strokes", self.prefix)
    }
}

pub struct LiveSessionNamespace {
    services: Services,
}

impl LiveSessionNamespace {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn emit(&self, ctx: &CommandContext<'_>, room: &Room, event: &str, payload: Value) {
        self.services
            .broadcaster
            .to_room(ctx.namespace, room, event, payload, Some(ctx.connection_id))
            .await;
    }

    async fn raise_hand(
        &self,
        ctx: &CommandContext<'_>,
        room: &Room,
    ) -> Result<Value, ServerError> {
        let keys = Keys::new(room);
        let store = &self.services.store;
        let ttl = Expiration::Refresh(self.services.ttl.live_session());

        if !store
            .add_to_set_with_expiration(&keys.raised(), ctx.user_id(), ttl)
            .await?
        {
            return Ok(json!({ "raised": false, "queue": self.queue(room).await? }));
        }
        let entry = json!({
            "user_id": ctx.user_id(),
            "display_name": ctx.identity.display_name,
            "raised_at": now_millis(),
        });
        let position = match store
            .push_to_list_with_expiration(&keys.hands(), entry, ttl)
            .await
        {
            Ok(position) => position,
            Err(e) => {
                // Leave the user free to raise again once the store is back.
                if let Err(undo) = store.remove_from_set(&keys.raised(), ctx.user_id()).await {
                    tracing::debug!("Could not undo raise for {}: {}", ctx.user_id(), undo);
                }
                return Err(e.into());
            }
        };

        self.emit(
            ctx,
            room,
            "hand_raised",
            json!({
                "room": room,
                "user_id": ctx.user_id(),
                "display_name": ctx.identity.display_name,
                "position": position,
            }),
        )
        .await;
        Ok(json!({ "raised": true, "position": position }))
    }

    /// Removes `user_id` from the queue. Returns whether they were in it.
    async fn remove_hand(&self, room: &Room, user_id: &str) -> Result<bool, ServerError> {
        let keys = Keys::new(room);
        let store = &self.services.store;
        let was_raised = store.remove_from_set(&keys.raised(), user_id).await?;
        for entry in store.get_list(&keys.hands()).await? {
            if entry.get("user_id").and_then(Value::as_str) == Some(user_id) {
                store.remove_from_list(&keys.hands(), &entry).await?;
            }
        }
        Ok(was_raised)
    }

    async fn lower_hand(
        &self,
        ctx: &CommandContext<'_>,
        room: &Room,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let target = match payload.get("user_id") {
            Some(_) => require_str(payload, "user_id")?,
            None => ctx.user_id(),
        };
        if target != ctx.user_id() {
            ctx.require_staff()?;
        }
        let lowered = self.remove_hand(room, target).await?;
        if lowered {
            self.emit(
                ctx,
                room,
                "hand_lowered",
                json!({"room": room, "user_id": target, "lowered_by": ctx.user_id()}),
            )
            .await;
        }
        Ok(json!({ "lowered": lowered, "user_id": target }))
    }

    async fn queue(&self, room: &Room) -> Result<Vec<Value>, ServerError> {
        Ok(self.services.store.get_list(&Keys::new(room).hands()).await?)
    }

    async fn poll_create(
        &self,
        ctx: &CommandContext<'_>,
        room: &Room,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        ctx.require_staff()?;
        let question = require_str(payload, "question")?;
        let options: Vec<String> = payload
            .get("options")
            .and_then(Value::as_array)
            .ok_or_else(|| ServerError::validation("'options' must be an array of strings"))?
            .iter()
            .map(|o| {
                o.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ServerError::validation("poll options must be strings"))
            })
            .collect::<Result<_, _>>()?;
        if options.len() < 2 || options.len() > MAX_POLL_OPTIONS {
            return Err(ServerError::validation(format!(
                "a poll needs 2-{} options",
                MAX_POLL_OPTIONS
            )));
        }

        let keys = Keys::new(room);
        let poll_id = uuid::Uuid::new_v4().simple().to_string();
        let poll = json!({
            "poll_id": poll_id,
            "question": question,
            "options": options,
            "created_by": ctx.user_id(),
            "created_at": now_millis(),
            "open": true,
        });
        self.services
            .store
            .set_hash_with_expiration(
                &keys.polls(),
                &poll_id,
                poll.clone(),
                Expiration::Refresh(self.services.ttl.live_session()),
            )
            .await?;

        self.emit(ctx, room, "poll_created", json!({"room": room, "poll": poll}))
            .await;
        Ok(poll)
    }

    async fn poll(&self, keys: &Keys, poll_id: &str) -> Result<Value, ServerError> {
        self.services
            .store
            .get_hash(&keys.polls(), poll_id)
            .await?
            .ok_or_else(|| ServerError::validation(format!("unknown poll '{}'", poll_id)))
    }

    /// Vote counts per option.
    async fn tally(
        &self,
        keys: &Keys,
        poll_id: &str,
        options: usize,
    ) -> Result<Vec<u64>, ServerError> {
        let mut counts = vec![0u64; options];
        let votes = self.services.store.get_all_hash(&keys.votes(poll_id)).await?;
        for choice in votes.values() {
            if let Some(slot) = choice.as_u64().and_then(|i| counts.get_mut(i as usize)) {
                *slot += 1;
            }
        }
        Ok(counts)
    }

    fn option_count(poll: &Value) -> usize {
        poll.get("options")
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    async fn poll_vote(
        &self,
        ctx: &CommandContext<'_>,
        room: &Room,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let poll_id = require_str(payload, "poll_id")?;
        let option = require_u64(payload, "option")?;
        let keys = Keys::new(room);
        let poll = self.poll(&keys, poll_id).await?;
        if poll.get("open") != Some(&Value::Bool(true)) {
            return Err(ServerError::validation(format!("poll '{}' is closed", poll_id)));
        }
        let options = Self::option_count(&poll);
        if option as usize >= options {
            return Err(ServerError::validation(format!(
                "option must be below {}",
                options
            )));
        }

        // One field per user: resubmission overwrites.
        let first_vote = self
            .services
            .store
            .set_hash_with_expiration(
                &keys.votes(poll_id),
                ctx.user_id(),
                json!(option),
                Expiration::Refresh(self.services.ttl.live_session()),
            )
            .await?;

        let counts = self.tally(&keys, poll_id, options).await?;
        let total: u64 = counts.iter().sum();
        self.emit(
            ctx,
            room,
            "poll_updated",
            json!({"room": room, "poll_id": poll_id, "total_votes": total}),
        )
        .await;
        Ok(json!({
            "poll_id": poll_id,
            "option": option,
            "first_vote": first_vote,
            "total_votes": total,
        }))
    }

    async fn poll_close(
        &self,
        ctx: &CommandContext<'_>,
        room: &Room,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        ctx.require_staff()?;
        let poll_id = require_str(payload, "poll_id")?;
        let keys = Keys::new(room);
        let mut poll = self.poll(&keys, poll_id).await?;
        if let Value::Object(ref mut map) = poll {
            map.insert("open".to_string(), Value::Bool(false));
        }
        self.services
            .store
            .set_hash_with_expiration(
                &keys.polls(),
                poll_id,
                poll.clone(),
                Expiration::Refresh(self.services.ttl.live_session()),
            )
            .await?;

        let counts = self.tally(&keys, poll_id, Self::option_count(&poll)).await?;
        let result = json!({
            "room": room,
            "poll_id": poll_id,
            "results": counts,
            "total_votes": counts.iter().sum::<u64>(),
        });
        self.emit(ctx, room, "poll_closed", result.clone()).await;
        Ok(result)
    }

    async fn open_polls(&self, room: &Room) -> Result<Vec<Value>, ServerError> {
        let mut polls: Vec<Value> = self
            .services
            .store
            .get_all_hash(&Keys::new(room).polls())
            .await?
            .into_values()
            .filter(|p| p.get("open") == Some(&Value::Bool(true)))
            .collect();
        polls.sort_by_key(|p| p.get("created_at").and_then(Value::as_i64).unwrap_or(0));
        Ok(polls)
    }

    async fn stroke(
        &self,
        ctx: &CommandContext<'_>,
        room: &Room,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let stroke = payload
            .get("stroke")
            .filter(|s| s.is_object())
            .ok_or_else(|| ServerError::validation("'stroke' must be an object"))?;
        let size = serde_json::to_vec(stroke)
            .map_err(|e| ServerError::validation(e.to_string()))?
            .len();
        if size > MAX_STROKE_BYTES {
            return Err(ServerError::validation(format!(
                "stroke is {} bytes, limit is {}",
                size, MAX_STROKE_BYTES
            )));
        }

        let keys = Keys::new(room);
        let store = &self.services.store;
        if store.list_len(&keys.strokes()).await? >= MAX_STROKES {
            return Err(ServerError::validation(format!(
                "whiteboard is full ({} strokes), clear it first",
                MAX_STROKES
            )));
        }
        let count = store
            .push_to_list_with_expiration(
                &keys.strokes(),
                json!({"user_id": ctx.user_id(), "stroke": stroke}),
                Expiration::Refresh(self.services.ttl.live_session()),
            )
            .await?;

        self.emit(
            ctx,
            room,
            "stroke",
            json!({"room": room, "user_id": ctx.user_id(), "stroke": stroke}),
        )
        .await;
        Ok(json!({ "strokes": count }))
    }

    async fn whiteboard_clear(
        &self,
        ctx: &CommandContext<'_>,
        room: &Room,
    ) -> Result<Value, ServerError> {
        ctx.require_staff()?;
        let cleared = self
            .services
            .store
            .delete_list(&Keys::new(room).strokes())
            .await?;
        self.emit(
            ctx,
            room,
            "whiteboard_cleared",
            json!({"room": room, "cleared_by": ctx.user_id()}),
        )
        .await;
        Ok(json!({ "cleared": cleared }))
    }
}

#[async_trait]
impl NamespaceHandler for LiveSessionNamespace {
    fn path(&self) -> &'static str {
        "/live"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::Session]
    }

    fn services(&self) -> &Services {
        &self.services
    }

    fn rate_limit(&self, command: &str) -> Option<RateLimit> {
        match command {
            "raise_hand" | "lower_hand" => Some(RateLimit::new(10, 60)),
            "poll_vote" => Some(RateLimit::new(20, 60)),
            "poll_create" | "poll_close" => Some(RateLimit::new(20, 60)),
            "stroke" => Some(RateLimit::new(120, 1)),
            "whiteboard_state" | "hand_queue" => Some(RateLimit::new(30, 60)),
            _ => None,
        }
    }

    async fn on_join(&self, _ctx: &CommandContext<'_>, room: &Room) -> Result<Value, ServerError> {
        Ok(json!({
            "hand_queue": self.queue(room).await?,
            "polls": self.open_polls(room).await?,
        }))
    }

    async fn on_leave(&self, ctx: &CommandContext<'_>, room: &Room) -> Result<(), ServerError> {
        if self.remove_hand(room, ctx.user_id()).await? {
            self.emit(
                ctx,
                room,
                "hand_lowered",
                json!({"room": room, "user_id": ctx.user_id(), "lowered_by": ctx.user_id()}),
            )
            .await;
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        ctx: &CommandContext<'_>,
        command: &str,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let room = ctx.joined_room(payload, Scope::Session)?;
        match command {
            "raise_hand" => self.raise_hand(ctx, &room).await,
            "lower_hand" => self.lower_hand(ctx, &room, payload).await,
            "hand_queue" => Ok(json!({ "room": room, "queue": self.queue(&room).await? })),
            "poll_create" => self.poll_create(ctx, &room, payload).await,
            "poll_vote" => self.poll_vote(ctx, &room, payload).await,
            "poll_close" => self.poll_close(ctx, &room, payload).await,
            "stroke" => self.stroke(ctx, &room, payload).await,
            "whiteboard_state" => {
                let strokes = self
                    .services
                    .store
                    .get_list(&Keys::new(&room).strokes())
                    .await?;
                Ok(json!({ "room": room, "strokes": strokes }))
            }
            "whiteboard_clear" => self.whiteboard_clear(ctx, &room).await,
            _ => Err(unknown_command(command)),
        }
    }
}

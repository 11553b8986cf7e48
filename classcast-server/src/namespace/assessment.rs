//! `/assessment`: in-progress assessment tracking and proctoring.
//!
//! Students join `assessment:{id}` and report progress; proctors join
//! `proctor:{id}` and watch it. State per assessment:
//!
//! - `assessment:{id}:progress`: hash of user -> latest progress. The outer
//!   TTL is the maximum session length, set once by the first write.
//! - `assessment:{id}:warned`: users already sent a timer warning.
//! - `assessment:{id}:alerts`: proctoring alerts, kept for the audit window.

use super::{
    now_millis, own_room, payload_room, require_str, require_u64, unknown_command,
    CommandContext, NamespaceHandler, Services,
};
use crate::error::ServerError;
use crate::rate_limit::RateLimit;
use crate::room::{Room, Scope};
use async_trait::async_trait;
use classcast_store::Expiration;
use serde_json::{json, Value};

fn progress_key(id: &str) -> String {
    format!("assessment:{}:progress", id)
}

fn warned_key(id: &str) -> String {
    format!("assessment:{}:warned", id)
}

fn alerts_key(id: &str) -> String {
    format!("assessment:{}:alerts", id)
}

fn proctor_room(id: &str) -> Result<Room, ServerError> {
    Room::new(Scope::Proctor, id)
}

pub struct AssessmentNamespace {
    services: Services,
}

impl AssessmentNamespace {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn to_proctors(
        &self,
        ctx: &CommandContext<'_>,
        id: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), ServerError> {
        self.services
            .broadcaster
            .to_room(
                ctx.namespace,
                &proctor_room(id)?,
                event,
                payload,
                Some(ctx.connection_id),
            )
            .await;
        Ok(())
    }

    /// The progress hash expires a fixed time after the first write.
    async fn write_progress(
        &self,
        id: &str,
        user_id: &str,
        entry: Value,
    ) -> Result<(), ServerError> {
        self.services
            .store
            .set_hash_with_expiration(
                &progress_key(id),
                user_id,
                entry,
                Expiration::Once(self.services.ttl.assessment()),
            )
            .await?;
        Ok(())
    }

    async fn progress(
        &self,
        ctx: &CommandContext<'_>,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let room = ctx.joined_room(payload, Scope::Assessment)?;
        let id = room.id();
        let total = require_u64(payload, "total")?;
        let answered = require_u64(payload, "answered")?;
        let question = require_u64(payload, "question")?;
        if answered > total || question > total {
            return Err(ServerError::validation(
                "'answered' and 'question' cannot exceed 'total'",
            ));
        }
        let remaining_secs = match payload.get("remaining_secs") {
            Some(_) => Some(require_u64(payload, "remaining_secs")?),
            None => None,
        };

        let entry = json!({
            "question": question,
            "answered": answered,
            "total": total,
            "remaining_secs": remaining_secs,
            "completed": false,
            "updated_at": now_millis(),
        });
        self.write_progress(id, ctx.user_id(), entry.clone()).await?;

        let mut update = json!({ "assessment": id, "user_id": ctx.user_id() });
        merge(&mut update, &entry);
        self.to_proctors(ctx, id, "progress_updated", update).await?;

        let warned = match remaining_secs {
            Some(left) if left <= self.services.ttl.timer_warning_secs => {
                self.timer_warning(ctx, id, left).await?
            }
            _ => false,
        };
        Ok(json!({ "recorded": true, "timer_warning": warned }))
    }

    /// Sends the one-time timer warning. Returns false if already sent.
    async fn timer_warning(
        &self,
        ctx: &CommandContext<'_>,
        id: &str,
        remaining_secs: u64,
    ) -> Result<bool, ServerError> {
        let first = self
            .services
            .store
            .add_to_set_with_expiration(
                &warned_key(id),
                ctx.user_id(),
                Expiration::Once(self.services.ttl.assessment()),
            )
            .await?;
        if !first {
            return Ok(false);
        }
        self.services
            .broadcaster
            .to_room(
                ctx.namespace,
                &own_room(ctx)?,
                "timer_warning",
                json!({ "assessment": id, "remaining_secs": remaining_secs }),
                None,
            )
            .await;
        Ok(true)
    }

    async fn proctor_alert(
        &self,
        ctx: &CommandContext<'_>,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let room = payload_room(payload)?;
        let subject = match room.scope() {
            Scope::Assessment => ctx.user_id().to_string(),
            Scope::Proctor => {
                ctx.require_staff()?;
                require_str(payload, "user_id")?.to_string()
            }
            _ => {
                return Err(ServerError::validation(
                    "proctor alerts target an assessment or proctor room",
                ))
            }
        };
        ctx.require_joined(&room)?;
        let kind = require_str(payload, "kind")?;
        let id = room.id();

        let alert = json!({
            "alert_id": uuid::Uuid::new_v4().simple().to_string(),
            "assessment": id,
            "user_id": subject,
            "kind": kind,
            "detail": payload.get("detail").cloned().unwrap_or(Value::Null),
            "reported_by": ctx.user_id(),
            "at": now_millis(),
        });
        self.services
            .store
            .push_to_list_with_expiration(
                &alerts_key(id),
                alert.clone(),
                Expiration::Refresh(self.services.ttl.proctor_audit()),
            )
            .await?;

        self.to_proctors(ctx, id, "proctor_alert", alert.clone()).await?;
        Ok(alert)
    }

    async fn complete(
        &self,
        ctx: &CommandContext<'_>,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        let room = ctx.joined_room(payload, Scope::Assessment)?;
        let id = room.id();
        let mut entry = self
            .services
            .store
            .get_hash(&progress_key(id), ctx.user_id())
            .await?
            .unwrap_or_else(|| json!({}));
        merge(
            &mut entry,
            &json!({ "completed": true, "updated_at": now_millis() }),
        );
        self.write_progress(id, ctx.user_id(), entry).await?;

        self.to_proctors(
            ctx,
            id,
            "assessment_completed",
            json!({ "assessment": id, "user_id": ctx.user_id() }),
        )
        .await?;
        Ok(json!({ "completed": true }))
    }

    /// Progress of every student, ordered by user id.
    pub async fn snapshot(&self, id: &str) -> Result<Vec<Value>, ServerError> {
        let mut students: Vec<(String, Value)> = self
            .services
            .store
            .get_all_hash(&progress_key(id))
            .await?
            .into_iter()
            .collect();
        students.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(students
            .into_iter()
            .map(|(user_id, entry)| {
                let mut row = json!({ "user_id": user_id });
                merge(&mut row, &entry);
                row
            })
            .collect())
    }

    async fn staff_query(
        &self,
        ctx: &CommandContext<'_>,
        payload: &Value,
        alerts: bool,
    ) -> Result<Value, ServerError> {
        ctx.require_staff()?;
        let room = ctx.joined_room(payload, Scope::Proctor)?;
        let id = room.id();
        if alerts {
            let alerts = self.services.store.get_list(&alerts_key(id)).await?;
            Ok(json!({ "assessment": id, "alerts": alerts }))
        } else {
            Ok(json!({ "assessment": id, "students": self.snapshot(id).await? }))
        }
    }
}

fn merge(target: &mut Value, extra: &Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        for (k, v) in extra {
            target.insert(k.clone(), v.clone());
        }
    }
}

#[async_trait]
impl NamespaceHandler for AssessmentNamespace {
    fn path(&self) -> &'static str {
        "/assessment"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::Assessment, Scope::Proctor, Scope::User]
    }

    fn services(&self) -> &Services {
        &self.services
    }

    fn rate_limit(&self, command: &str) -> Option<RateLimit> {
        match command {
            "progress" => Some(RateLimit::new(60, 60)),
            "proctor_alert" => Some(RateLimit::new(30, 60)),
            "complete" => Some(RateLimit::new(5, 60)),
            "progress_snapshot" | "alerts" => Some(RateLimit::new(30, 60)),
            _ => None,
        }
    }

    async fn on_connect(&self, ctx: &CommandContext<'_>) -> Result<Vec<Room>, ServerError> {
        Ok(vec![own_room(ctx)?])
    }

    async fn on_join(&self, ctx: &CommandContext<'_>, room: &Room) -> Result<Value, ServerError> {
        match room.scope() {
            Scope::Proctor => Ok(json!({ "students": self.snapshot(room.id()).await? })),
            Scope::Assessment => {
                let own = self
                    .services
                    .store
                    .get_hash(&progress_key(room.id()), ctx.user_id())
                    .await?;
                Ok(json!({ "progress": own }))
            }
            _ => Ok(json!({})),
        }
    }

    async fn handle_command(
        &self,
        ctx: &CommandContext<'_>,
        command: &str,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        match command {
            "progress" => self.progress(ctx, payload).await,
            "proctor_alert" => self.proctor_alert(ctx, payload).await,
            "complete" => self.complete(ctx, payload).await,
            "progress_snapshot" => self.staff_query(ctx, payload, false).await,
            "alerts" => self.staff_query(ctx, payload, true).await,
            _ => Err(unknown_command(command)),
        }
    }
}

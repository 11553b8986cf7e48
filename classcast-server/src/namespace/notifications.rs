//! `/notifications`: per-user notifications and organizational announcements.

use super::{own_room, require_str, unknown_command, CommandContext, NamespaceHandler, Services};
use crate::error::ServerError;
use crate::rate_limit::RateLimit;
use crate::room::{Room, Scope};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct NotificationsNamespace {
    services: Services,
}

impl NotificationsNamespace {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Tells the user's other connections that a notification was read.
    async fn ack(&self, ctx: &CommandContext<'_>, payload: &Value) -> Result<Value, ServerError> {
        let notification_id = require_str(payload, "notification_id")?;
        let room = own_room(ctx)?;
        self.services
            .broadcaster
            .to_room(
                ctx.namespace,
                &room,
                "notification_acked",
                json!({ "notification_id": notification_id }),
                Some(ctx.connection_id),
            )
            .await;
        Ok(json!({ "acked": notification_id }))
    }
}

#[async_trait]
impl NamespaceHandler for NotificationsNamespace {
    fn path(&self) -> &'static str {
        "/notifications"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::User, Scope::Tenant, Scope::District, Scope::School]
    }

    fn services(&self) -> &Services {
        &self.services
    }

    fn rate_limit(&self, command: &str) -> Option<RateLimit> {
        match command {
            "ack" => Some(RateLimit::new(120, 60)),
            _ => None,
        }
    }

    async fn on_connect(&self, ctx: &CommandContext<'_>) -> Result<Vec<Room>, ServerError> {
        Ok(vec![own_room(ctx)?])
    }

    async fn handle_command(
        &self,
        ctx: &CommandContext<'_>,
        command: &str,
        payload: &Value,
    ) -> Result<Value, ServerError> {
        match command {
            "ack" => self.ack(ctx, payload).await,
            _ => Err(unknown_command(command)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::namespace::testing::{Conn, Harness};

    #[tokio::test]
    async fn test_ack_syncs_other_devices() {
        let harness = Harness::new();
        let ns = NotificationsNamespace::new(harness.services.clone());
        let mut phone = harness.listener("/notifications", &["user:u1"]);
        let conn = Conn::new("/notifications", "u1", Role::Guardian).joined("user:u1");

        let result = ns
            .handle_command(&conn.ctx(), "ack", &json!({"notification_id": "n-7"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"acked": "n-7"}));

        let event = phone.recv().await.unwrap();
        assert_eq!(event.event, "notification_acked");
        assert_eq!(event.payload["notification_id"], "n-7");
    }

    #[tokio::test]
    async fn test_ack_requires_id() {
        let ns = NotificationsNamespace::new(Harness::new().services);
        let conn = Conn::new("/notifications", "u1", Role::Student);
        assert!(ns
            .handle_command(&conn.ctx(), "ack", &json!({}))
            .await
            .is_err());
        assert_eq!(ns.rate_limit("ack"), Some(RateLimit::new(120, 60)));
        assert_eq!(ns.rate_limit("other"), None);
    }
}

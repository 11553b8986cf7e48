//! `/gradebook`: grade postings and gradebook changes.
//!
//! Stateless. Clients join class or school rooms; students also receive
//! their own postings through the auto-joined user room.

use super::{own_room, CommandContext, NamespaceHandler, Services};
use crate::error::ServerError;
use crate::room::{Room, Scope};
use async_trait::async_trait;

pub struct GradebookNamespace {
    services: Services,
}

impl GradebookNamespace {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl NamespaceHandler for GradebookNamespace {
    fn path(&self) -> &'static str {
        "/gradebook"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::Class, Scope::School, Scope::User]
    }

    fn services(&self) -> &Services {
        &self.services
    }

    async fn on_connect(&self, ctx: &CommandContext<'_>) -> Result<Vec<Room>, ServerError> {
        Ok(vec![own_room(ctx)?])
    }
}

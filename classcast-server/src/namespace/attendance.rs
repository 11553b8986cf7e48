//! `/attendance`: attendance marks for classes and school offices.

use super::{NamespaceHandler, Services};
use crate::room::Scope;
use async_trait::async_trait;

pub struct AttendanceNamespace {
    services: Services,
}

impl AttendanceNamespace {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl NamespaceHandler for AttendanceNamespace {
    fn path(&self) -> &'static str {
        "/attendance"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::Class, Scope::School]
    }

    fn services(&self) -> &Services {
        &self.services
    }
}

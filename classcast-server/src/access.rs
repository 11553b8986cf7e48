//! Room join authorization.
//!
//! Authorization is derived on every join from the identity's claims and the
//! ownership record of the target resource, read from the [`AccessDirectory`]
//! (the read boundary to the platform's relational data). Membership in a
//! parent room never implies access to a child room.

use crate::auth::{Identity, Role};
use crate::config::ConfigError;
use crate::error::ServerError;
use crate::room::{Room, Scope};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Ownership record of a resource (class, conversation, live session,
/// assessment), organizational unit or user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRecord {
    pub tenant: String,
    pub district: Option<String>,
    pub school: Option<String>,
    pub members: HashSet<String>,
    pub staff: HashSet<String>,
}

impl ResourceRecord {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            ..Default::default()
        }
    }

    pub fn in_school(mut self, district: impl Into<String>, school: impl Into<String>) -> Self {
        self.district = Some(district.into());
        self.school = Some(school.into());
        self
    }

    pub fn with_member(mut self, user: impl Into<String>) -> Self {
        self.members.insert(user.into());
        self
    }

    pub fn with_staff(mut self, user: impl Into<String>) -> Self {
        self.staff.insert(user.into());
        self
    }

    fn admin_of(&self, identity: &Identity) -> bool {
        match identity.role {
            Role::SchoolAdmin => {
                self.school.is_some() && self.school == identity.tenant.school
            }
            Role::DistrictAdmin => {
                self.district.is_some() && self.district == identity.tenant.district
            }
            _ => false,
        }
    }
}

#[async_trait]
pub trait AccessDirectory: Send + Sync {
    /// Returns the record behind a room, if any.
    async fn lookup(&self, room: &Room) -> Result<Option<ResourceRecord>, ServerError>;
}

/// Checks whether `identity` may join `room`.
pub async fn authorize(
    directory: &dyn AccessDirectory,
    identity: &Identity,
    room: &Room,
) -> Result<(), ServerError> {
    let path = &identity.tenant;
    let denied = || ServerError::unauthorized(format!("access to {} denied", room));

    match room.scope() {
        Scope::User => {
            if room.id() == identity.user_id {
                return Ok(());
            }
            if identity.role == Role::Service {
                let record = directory.lookup(room).await?;
                if record.is_some_and(|r| r.tenant == path.tenant) {
                    return Ok(());
                }
            }
            Err(denied())
        }
        Scope::Tenant => {
            if room.id() == path.tenant {
                Ok(())
            } else {
                Err(denied())
            }
        }
        Scope::District => {
            if path.district.as_deref() == Some(room.id()) {
                return Ok(());
            }
            if identity.role == Role::Service {
                let record = directory.lookup(room).await?;
                if record.is_some_and(|r| r.tenant == path.tenant) {
                    return Ok(());
                }
            }
            Err(denied())
        }
        Scope::School => {
            if path.school.as_deref() == Some(room.id()) {
                return Ok(());
            }
            if matches!(identity.role, Role::DistrictAdmin | Role::Service) {
                let record = directory.lookup(room).await?.ok_or_else(denied)?;
                if record.tenant == path.tenant
                    && (identity.role == Role::Service || record.admin_of(identity))
                {
                    return Ok(());
                }
            }
            Err(denied())
        }
        Scope::Class | Scope::Conversation | Scope::Session | Scope::Assessment => {
            let record = directory.lookup(room).await?.ok_or_else(denied)?;
            if record.tenant != path.tenant {
                return Err(denied());
            }
            let allowed = identity.role == Role::Service
                || record.members.contains(&identity.user_id)
                || record.staff.contains(&identity.user_id)
                || record.admin_of(identity);
            if allowed {
                Ok(())
            } else {
                Err(denied())
            }
        }
        Scope::Proctor => {
            let record = directory
                .lookup(&room.resource())
                .await?
                .ok_or_else(denied)?;
            if record.tenant != path.tenant {
                return Err(denied());
            }
            let allowed = identity.role == Role::Service
                || record.staff.contains(&identity.user_id)
                || record.admin_of(identity);
            if allowed {
                Ok(())
            } else {
                Err(denied())
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DirectoryFixture {
    resources: HashMap<String, ResourceRecord>,
}

/// In-memory directory for development and tests.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    records: DashMap<Room, ResourceRecord>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads records from a YAML fixture:
    ///
    /// ```yaml
    /// resources:
    ///   "class:c1": { tenant: acme, district: d1, school: s1, members: [u1], staff: [t1] }
    /// ```
    pub fn from_fixture(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let fixture: DirectoryFixture = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;

        let directory = Self::new();
        for (name, record) in fixture.resources {
            let room: Room = name.parse().map_err(|e: ServerError| {
                ConfigError::ParseError(path.to_path_buf(), e.to_string())
            })?;
            directory.insert(room, record);
        }
        Ok(directory)
    }

    pub fn insert(&self, room: Room, record: ResourceRecord) {
        self.records.insert(room, record);
    }

    pub fn remove(&self, room: &Room) -> Option<ResourceRecord> {
        self.records.remove(room).map(|(_, r)| r)
    }

    pub fn grant_member(&self, room: &Room, user: &str) -> bool {
        self.records
            .get_mut(room)
            .map(|mut r| r.members.insert(user.to_string()))
            .unwrap_or(false)
    }

    pub fn grant_staff(&self, room: &Room, user: &str) -> bool {
        self.records
            .get_mut(room)
            .map(|mut r| r.staff.insert(user.to_string()))
            .unwrap_or(false)
    }

    /// Removes a user from both the member and staff lists.
    pub fn revoke(&self, room: &Room, user: &str) -> bool {
        self.records
            .get_mut(room)
            .map(|mut r| {
                let member = r.members.remove(user);
                let staff = r.staff.remove(user);
                member || staff
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl AccessDirectory for MemoryDirectory {
    async fn lookup(&self, room: &Room) -> Result<Option<ResourceRecord>, ServerError> {
        Ok(self.records.get(room).map(|r| r.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TenantPath;
    use classcast_protocol::ErrorCode;
    use std::io::Write;

    fn room(s: &str) -> Room {
        s.parse().unwrap()
    }

    fn identity(user: &str, role: Role) -> Identity {
        Identity::new(
            user,
            role,
            TenantPath::new("acme").with_district("d1").with_school("s1"),
        )
    }

    fn directory() -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.insert(
            room("class:c1"),
            ResourceRecord::new("acme")
                .in_school("d1", "s1")
                .with_member("stu")
                .with_staff("tch"),
        );
        dir.insert(
            room("assessment:a1"),
            ResourceRecord::new("acme")
                .in_school("d1", "s1")
                .with_member("stu")
                .with_staff("tch"),
        );
        dir.insert(
            room("class:other-tenant"),
            ResourceRecord::new("globex").with_member("stu"),
        );
        dir.insert(room("school:s2"), ResourceRecord::new("acme").in_school("d1", "s2"));
        dir.insert(room("school:s9"), ResourceRecord::new("acme").in_school("d9", "s9"));
        dir
    }

    async fn allowed(dir: &MemoryDirectory, who: &Identity, target: &str) -> bool {
        authorize(dir, who, &room(target)).await.is_ok()
    }

    #[tokio::test]
    async fn test_user_rooms_are_private() {
        let dir = directory();
        let stu = identity("stu", Role::Student);
        assert!(allowed(&dir, &stu, "user:stu").await);
        assert!(!allowed(&dir, &stu, "user:tch").await);
        assert!(!allowed(&dir, &identity("tch", Role::Teacher), "user:stu").await);
    }

    #[tokio::test]
    async fn test_organizational_rooms_follow_tenant_path() {
        let dir = directory();
        let stu = identity("stu", Role::Student);
        assert!(allowed(&dir, &stu, "tenant:acme").await);
        assert!(!allowed(&dir, &stu, "tenant:globex").await);
        assert!(allowed(&dir, &stu, "district:d1").await);
        assert!(allowed(&dir, &stu, "school:s1").await);
        assert!(!allowed(&dir, &stu, "school:s2").await);

        let dadmin = identity("boss", Role::DistrictAdmin);
        assert!(allowed(&dir, &dadmin, "school:s2").await);
        assert!(!allowed(&dir, &dadmin, "school:s9").await);
    }

    #[tokio::test]
    async fn test_resource_membership() {
        let dir = directory();
        assert!(allowed(&dir, &identity("stu", Role::Student), "class:c1").await);
        assert!(allowed(&dir, &identity("tch", Role::Teacher), "class:c1").await);
        assert!(!allowed(&dir, &identity("stranger", Role::Student), "class:c1").await);
        assert!(!allowed(&dir, &identity("stu", Role::Student), "class:missing").await);
        assert!(allowed(&dir, &identity("sa", Role::SchoolAdmin), "class:c1").await);
    }

    #[tokio::test]
    async fn test_cross_tenant_denied() {
        let dir = directory();
        let err = authorize(
            &dir,
            &identity("stu", Role::Student),
            &room("class:other-tenant"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Unauthorized);
        assert!(!allowed(&dir, &identity("svc", Role::Service), "class:other-tenant").await);
        assert!(allowed(&dir, &identity("svc", Role::Service), "class:c1").await);
    }

    #[tokio::test]
    async fn test_proctor_room_is_staff_only() {
        let dir = directory();
        assert!(allowed(&dir, &identity("tch", Role::Teacher), "proctor:a1").await);
        assert!(!allowed(&dir, &identity("stu", Role::Student), "proctor:a1").await);
        assert!(allowed(&dir, &identity("stu", Role::Student), "assessment:a1").await);
    }

    #[tokio::test]
    async fn test_revocation_applies_to_next_check() {
        let dir = directory();
        let stu = identity("stu", Role::Student);
        assert!(allowed(&dir, &stu, "class:c1").await);
        assert!(dir.revoke(&room("class:c1"), "stu"));
        assert!(!allowed(&dir, &stu, "class:c1").await);
        assert!(dir.grant_member(&room("class:c1"), "stu"));
        assert!(allowed(&dir, &stu, "class:c1").await);
    }

    #[tokio::test]
    async fn test_fixture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
resources:
  "class:c1":
    tenant: acme
    district: d1
    school: s1
    members: [u1]
    staff: [t1]
  "user:u1":
    tenant: acme
"#
        )
        .unwrap();

        let dir = MemoryDirectory::from_fixture(file.path()).unwrap();
        assert_eq!(dir.len(), 2);
        let record = dir.lookup(&room("class:c1")).await.unwrap().unwrap();
        assert!(record.members.contains("u1"));
        assert!(record.staff.contains("t1"));
        assert!(allowed(&dir, &identity("svc", Role::Service), "user:u1").await);
    }

    #[test]
    fn test_fixture_rejects_bad_room() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "resources:\n  \"bogus\": {{ tenant: acme }}\n").unwrap();
        assert!(matches!(
            MemoryDirectory::from_fixture(file.path()),
            Err(ConfigError::ParseError(..))
        ));
    }
}

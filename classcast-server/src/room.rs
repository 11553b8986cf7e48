//! Room names.
//!
//! A room is `{scope}:{id}`, where the scope places it in the organizational
//! hierarchy (tenant, district, school, class, feature instance or a single
//! user) and the id is 1-128 characters from `[A-Za-z0-9_.-]`.

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Tenant,
    District,
    School,
    Class,
    Conversation,
    Session,
    Assessment,
    Proctor,
    User,
}

impl Scope {
    pub const ALL: [Scope; 9] = [
        Scope::Tenant,
        Scope::District,
        Scope::School,
        Scope::Class,
        Scope::Conversation,
        Scope::Session,
        Scope::Assessment,
        Scope::Proctor,
        Scope::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Tenant => "tenant",
            Scope::District => "district",
            Scope::School => "school",
            Scope::Class => "class",
            Scope::Conversation => "conversation",
            Scope::Session => "session",
            Scope::Assessment => "assessment",
            Scope::Proctor => "proctor",
            Scope::User => "user",
        }
    }

    /// Scopes naming a level of the tenant hierarchy.
    pub fn is_organizational(&self) -> bool {
        matches!(self, Scope::Tenant | Scope::District | Scope::School)
    }
}

impl FromStr for Scope {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| ServerError::validation(format!("unknown room scope '{}'", s)))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Room {
    scope: Scope,
    id: String,
}

impl Room {
    pub fn new(scope: Scope, id: impl Into<String>) -> Result<Self, ServerError> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self { scope, id })
    }

    pub fn user(user_id: &str) -> Result<Self, ServerError> {
        Self::new(Scope::User, user_id)
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The room of the resource this room is attached to.
    ///
    /// A proctor room belongs to the assessment with the same id.
    pub fn resource(&self) -> Room {
        match self.scope {
            Scope::Proctor => Room {
                scope: Scope::Assessment,
                id: self.id.clone(),
            },
            _ => self.clone(),
        }
    }
}

fn validate_id(id: &str) -> Result<(), ServerError> {
    if id.is_empty() || id.len() > MAX_ROOM_ID_LEN {
        return Err(ServerError::validation(format!(
            "room id must be 1-{} characters",
            MAX_ROOM_ID_LEN
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
    {
        return Err(ServerError::validation(format!(
            "room id '{}' contains invalid characters",
            id
        )));
    }
    Ok(())
}

impl FromStr for Room {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scope, id) = s
            .split_once(':')
            .ok_or_else(|| ServerError::validation(format!("room '{}' is not scope:id", s)))?;
        Room::new(scope.parse()?, id)
    }
}

impl TryFrom<String> for Room {
    type Error = ServerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Room> for String {
    fn from(room: Room) -> Self {
        room.to_string()
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse() {
        let room: Room = "class:algebra-2.period_3".parse().unwrap();
        assert_eq!(room.scope(), Scope::Class);
        assert_eq!(room.id(), "algebra-2.period_3");
        assert_eq!(room.to_string(), "class:algebra-2.period_3");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "class",
            "class:",
            "galaxy:c1",
            "class:a b",
            "class:a:b",
            "user:ü",
            ":c1",
        ] {
            assert!(bad.parse::<Room>().is_err(), "{} should be rejected", bad);
        }
        let long = format!("class:{}", "a".repeat(MAX_ROOM_ID_LEN + 1));
        assert!(long.parse::<Room>().is_err());
    }

    #[test]
    fn test_proctor_resource() {
        let room: Room = "proctor:exam-1".parse().unwrap();
        assert_eq!(room.resource().to_string(), "assessment:exam-1");
        let class: Room = "class:c1".parse().unwrap();
        assert_eq!(class.resource(), class);
    }

    #[test]
    fn test_serde_as_string() {
        let room: Room = serde_json::from_str("\"session:s1\"").unwrap();
        assert_eq!(room.scope(), Scope::Session);
        assert_eq!(serde_json::to_string(&room).unwrap(), "\"session:s1\"");
        assert!(serde_json::from_str::<Room>("\"nope\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_names_roundtrip(
            scope_idx in 0usize..Scope::ALL.len(),
            id in "[A-Za-z0-9_.-]{1,128}",
        ) {
            let scope = Scope::ALL[scope_idx];
            let name = format!("{}:{}", scope, id);
            let room: Room = name.parse().unwrap();
            prop_assert_eq!(room.scope(), scope);
            prop_assert_eq!(room.to_string(), name);
        }

        #[test]
        fn prop_invalid_characters_rejected(
            prefix in "[a-z0-9]{0,5}",
            bad in "[^A-Za-z0-9_.-]",
        ) {
            let name = format!("class:{}{}", prefix, bad);
            prop_assert!(name.parse::<Room>().is_err());
        }
    }
}

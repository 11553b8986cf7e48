//! Connection authentication.
//!
//! Clients present a bearer credential (an HS256-signed JWT issued by the
//! platform) in the handshake. A valid token yields an [`Identity`]: who the
//! user is, their role, and the tenant path they belong to.

use crate::config::AuthConfig;
use crate::error::ServerError;
use crate::room::{Room, MAX_ROOM_ID_LEN};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Guardian,
    Teacher,
    SchoolAdmin,
    DistrictAdmin,
    /// Out-of-process business logic.
    Service,
}

impl Role {
    /// Roles allowed to run staff-only commands.
    pub fn is_staff(&self) -> bool {
        matches!(
            self,
            Role::Teacher | Role::SchoolAdmin | Role::DistrictAdmin | Role::Service
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Guardian => "guardian",
            Role::Teacher => "teacher",
            Role::SchoolAdmin => "school_admin",
            Role::DistrictAdmin => "district_admin",
            Role::Service => "service",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an identity in the organizational hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPath {
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school: Option<String>,
}

impl TenantPath {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            district: None,
            school: None,
        }
    }

    pub fn with_district(mut self, district: impl Into<String>) -> Self {
        self.district = Some(district.into());
        self
    }

    pub fn with_school(mut self, school: impl Into<String>) -> Self {
        self.school = Some(school.into());
        self
    }
}

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub tenant: TenantPath,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role, tenant: TenantPath) -> Self {
        let user_id = user_id.into();
        Self {
            display_name: user_id.clone(),
            user_id,
            role,
            tenant,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn is_staff(&self) -> bool {
        self.role.is_staff()
    }
}

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: Role,
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school: Option<String>,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Identity {
            display_name: claims.name.unwrap_or_else(|| claims.sub.clone()),
            user_id: claims.sub,
            role: claims.role,
            tenant: TenantPath {
                tenant: claims.tenant,
                district: claims.district,
                school: claims.school,
            },
        }
    }
}

/// Verifies (and, for development tooling, issues) credentials.
pub struct Authenticator {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
    issuer: Option<String>,
}

impl Authenticator {
    pub fn new(secret: &[u8], issuer: Option<String>, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        if let Some(ref iss) = issuer {
            validation.set_issuer(&[iss.as_str()]);
        }
        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation,
            issuer,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, ServerError> {
        let secret = config
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServerError::Internal("no JWT secret configured".to_string()))?;
        Ok(Self::new(
            secret.as_bytes(),
            config.issuer.clone(),
            config.leeway_secs,
        ))
    }

    /// Validates a bearer credential. A leading "Bearer " is accepted.
    pub fn authenticate(&self, token: &str) -> Result<Identity, ServerError> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        if token.is_empty() {
            return Err(ServerError::unauthorized("missing credential"));
        }

        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| ServerError::unauthorized(format!("invalid credential: {}", e)))?;
        let claims = data.claims;

        if claims.sub.is_empty() || claims.tenant.is_empty() {
            return Err(ServerError::unauthorized(
                "credential lacks subject or tenant",
            ));
        }
        // The subject names the connection's private room.
        if Room::user(&claims.sub).is_err() {
            return Err(ServerError::unauthorized(format!(
                "subject '{}' is not a valid user id (1-{} of A-Z a-z 0-9 _ . -)",
                claims.sub,
                MAX_ROOM_ID_LEN
            )));
        }
        Ok(claims.into())
    }

    /// Signs a credential for `identity` valid for `ttl`.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String, ServerError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: identity.user_id.clone(),
            name: Some(identity.display_name.clone()),
            role: identity.role,
            tenant: identity.tenant.tenant.clone(),
            district: identity.tenant.district.clone(),
            school: identity.tenant.school.clone(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
            iss: self.issuer.clone(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ServerError::Internal(format!("failed to sign credential: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classcast_protocol::ErrorCode;

    fn teacher() -> Identity {
        Identity::new(
            "t-1",
            Role::Teacher,
            TenantPath::new("acme").with_district("d1").with_school("s1"),
        )
        .with_display_name("Ms. Frizzle")
    }

    #[test]
    fn test_issue_and_authenticate() {
        let auth = Authenticator::new(b"secret", None, 0);
        let token = auth.issue(&teacher(), Duration::from_secs(60)).unwrap();

        let identity = auth.authenticate(&token).unwrap();
        assert_eq!(identity, teacher());

        let bearer = format!("Bearer {}", token);
        assert_eq!(auth.authenticate(&bearer).unwrap().user_id, "t-1");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = Authenticator::new(b"one", None, 0);
        let verifier = Authenticator::new(b"two", None, 0);
        let token = issuer.issue(&teacher(), Duration::from_secs(60)).unwrap();

        let err = verifier.authenticate(&token).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Unauthorized);
    }

    #[test]
    fn test_expired_rejected() {
        let auth = Authenticator::new(b"secret", None, 0);
        let token = auth.issue(&teacher(), Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(auth.authenticate(&token).is_err());
    }

    #[test]
    fn test_issuer_enforced() {
        let platform = Authenticator::new(b"secret", Some("platform".into()), 0);
        let other = Authenticator::new(b"secret", Some("other".into()), 0);
        let token = other.issue(&teacher(), Duration::from_secs(60)).unwrap();
        assert!(platform.authenticate(&token).is_err());
    }

    #[test]
    fn test_garbage_and_empty() {
        let auth = Authenticator::new(b"secret", None, 0);
        assert!(auth.authenticate("").is_err());
        assert!(auth.authenticate("Bearer ").is_err());
        assert!(auth.authenticate("not.a.jwt").is_err());
    }

    #[test]
    fn test_subject_must_fit_user_room() {
        let auth = Authenticator::new(b"secret", None, 0);
        let email = Identity::new("alice@school.org", Role::Student, TenantPath::new("acme"));
        let token = auth.issue(&email, Duration::from_secs(60)).unwrap();

        let err = auth.authenticate(&token).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Unauthorized);
        assert!(err.to_string().contains("alice@school.org"));

        let long = Identity::new("u".repeat(129), Role::Student, TenantPath::new("acme"));
        let token = auth.issue(&long, Duration::from_secs(60)).unwrap();
        assert!(auth.authenticate(&token).is_err());

        let fine = Identity::new("alice.smith-2_b", Role::Student, TenantPath::new("acme"));
        let token = auth.issue(&fine, Duration::from_secs(60)).unwrap();
        assert_eq!(auth.authenticate(&token).unwrap().user_id, "alice.smith-2_b");
    }

    #[test]
    fn test_staff_roles() {
        assert!(Role::Teacher.is_staff());
        assert!(Role::Service.is_staff());
        assert!(!Role::Student.is_staff());
        assert!(!Role::Guardian.is_staff());
        assert_eq!(
            serde_json::to_value(Role::SchoolAdmin).unwrap(),
            "school_admin"
        );
    }
}

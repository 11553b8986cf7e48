//! Gateway configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CLASSCAST_CONFIG)
//! 3. Environment variables
//!
//! [`Config::validate`] must pass before the gateway starts.

use crate::rate_limit::RateLimit;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub heartbeat: HeartbeatConfig,
    pub store: StoreConfig,
    pub deployment: DeploymentConfig,
    pub auth: AuthConfig,
    pub rate_limits: RateLimitsConfig,
    pub ttl: TtlConfig,
    pub directory: DirectoryConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CLASSCAST_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.heartbeat.apply_env_overrides();
        self.store.apply_env_overrides();
        self.deployment.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.ttl.apply_env_overrides();
        self.directory.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Reads secrets referenced by path (currently the JWT secret file).
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Checks cross-section constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deployment.mode == DeploymentMode::Multi && self.store.mode != StoreMode::Remote {
            return Err(ConfigError::ValidationError(
                "deployment.mode=multi requires store.mode=remote".to_string(),
            ));
        }
        if self.store.mode == StoreMode::Remote {
            self.store.endpoint_addr()?;
        }
        if self.store.call_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "store.call_timeout_ms must be positive".to_string(),
            ));
        }
        self.heartbeat.validate()?;
        self.ttl.validate()?;
        self.rate_limits.validate()?;
        if self.auth.jwt_secret.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::ValidationError(
                "auth.jwt_secret (or auth.jwt_secret_file) must be set".to_string(),
            ));
        }
        if self.network.outbound_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "network.outbound_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(parsed) = raw.parse() {
            *target = parsed;
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    /// Capacity of each connection's outbound event queue.
    pub outbound_buffer: usize,
    /// Time allowed between accept and a valid handshake.
    pub handshake_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((
                [127, 0, 0, 1],
                classcast_protocol::DEFAULT_GATEWAY_PORT,
            )),
            max_connections: 10_000,
            outbound_buffer: 256,
            handshake_timeout_secs: 10,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        env_parse("CLASSCAST_BIND", &mut self.bind_addr);
        env_parse("CLASSCAST_MAX_CONNECTIONS", &mut self.max_connections);
        env_parse("CLASSCAST_OUTBOUND_BUFFER", &mut self.outbound_buffer);
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval advertised to clients.
    pub interval_secs: u64,
    /// Connections silent for this long are disconnected.
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 25,
            timeout_secs: 60,
        }
    }
}

impl HeartbeatConfig {
    fn apply_env_overrides(&mut self) {
        env_parse("CLASSCAST_HEARTBEAT_INTERVAL", &mut self.interval_secs);
        env_parse("CLASSCAST_HEARTBEAT_TIMEOUT", &mut self.timeout_secs);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 || self.timeout_secs <= self.interval_secs {
            return Err(ConfigError::ValidationError(format!(
                "heartbeat.timeout_secs ({}) must exceed a positive heartbeat.interval_secs ({})",
                self.timeout_secs, self.interval_secs
            )));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// In-process store; single-process deployments and development only.
    #[default]
    Memory,
    /// Networked coordination store daemon.
    Remote,
}

/// Coordination store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub mode: StoreMode,
    /// Daemon address as `host:port`.
    pub endpoint: Option<String>,
    pub call_timeout_ms: u64,
    /// Shared secret presented to the daemon.
    pub token: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::Memory,
            endpoint: None,
            call_timeout_ms: 2000,
            token: None,
        }
    }
}

impl StoreConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("CLASSCAST_STORE_MODE") {
            match mode.to_lowercase().as_str() {
                "memory" => self.mode = StoreMode::Memory,
                "remote" => self.mode = StoreMode::Remote,
                _ => {}
            }
        }
        if let Ok(endpoint) = std::env::var("CLASSCAST_STORE_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Ok(token) = std::env::var("CLASSCAST_STORE_TOKEN") {
            self.token = Some(token);
        }
        env_parse("CLASSCAST_STORE_TIMEOUT_MS", &mut self.call_timeout_ms);
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Resolves the daemon endpoint.
    pub fn endpoint_addr(&self) -> Result<SocketAddr, ConfigError> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            ConfigError::ValidationError("store.mode=remote requires store.endpoint".to_string())
        })?;
        endpoint
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "store.endpoint '{}' does not resolve",
                    endpoint
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// One gateway process; fan-out stays in process.
    #[default]
    Single,
    /// Several gateway processes sharing the coordination store.
    Multi,
}

/// Deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub mode: DeploymentMode,
    /// Pub/sub channel carrying cross-process broadcast envelopes.
    pub fanout_channel: String,
    /// Identifies this process in envelopes. Generated when unset.
    pub instance_id: Option<String>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Single,
            fanout_channel: "classcast:fanout".to_string(),
            instance_id: None,
        }
    }
}

impl DeploymentConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("CLASSCAST_INSTANCE_MODE") {
            match mode.to_lowercase().as_str() {
                "single" => self.mode = DeploymentMode::Single,
                "multi" => self.mode = DeploymentMode::Multi,
                _ => {}
            }
        }
        if let Ok(id) = std::env::var("CLASSCAST_INSTANCE_ID") {
            self.instance_id = Some(id);
        }
    }
}

/// Credential verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret shared with the credential issuer.
    pub jwt_secret: Option<String>,
    /// File holding the secret; takes precedence over `jwt_secret`.
    pub jwt_secret_file: Option<PathBuf>,
    /// Required `iss` claim, if set.
    pub issuer: Option<String>,
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_secret_file: None,
            issuer: None,
            leeway_secs: 30,
        }
    }
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("CLASSCAST_JWT_SECRET") {
            self.jwt_secret = Some(secret);
        }
        if let Ok(path) = std::env::var("CLASSCAST_JWT_SECRET_FILE") {
            self.jwt_secret_file = Some(PathBuf::from(path));
        }
        if let Ok(issuer) = std::env::var("CLASSCAST_JWT_ISSUER") {
            self.issuer = Some(issuer);
        }
    }

    /// Loads the secret from `jwt_secret_file` if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.jwt_secret_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            let secret = content.trim();
            if secret.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "JWT secret file '{}' is empty",
                    path.display()
                )));
            }
            self.jwt_secret = Some(secret.to_string());
        }
        Ok(())
    }
}

/// Rate limit table.
///
/// Override keys are either a bare command (`raise_hand`) or a command
/// qualified by namespace (`/live:raise_hand`); the qualified form wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub default: RateLimit,
    pub commands: HashMap<String, RateLimit>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            default: RateLimit::new(60, 60),
            commands: HashMap::new(),
        }
    }
}

impl RateLimitsConfig {
    /// Looks up a configured override for a command.
    pub fn override_for(&self, namespace: &str, command: &str) -> Option<RateLimit> {
        self.commands
            .get(&format!("{}:{}", namespace, command))
            .or_else(|| self.commands.get(command))
            .copied()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        std::iter::once(("default", &self.default))
            .chain(self.commands.iter().map(|(k, v)| (k.as_str(), v)))
            .try_for_each(|(name, limit)| {
                if limit.max_events == 0 || limit.window_secs == 0 {
                    Err(ConfigError::ValidationError(format!(
                        "rate limit '{}' must have positive max_events and window_secs",
                        name
                    )))
                } else {
                    Ok(())
                }
            })
    }
}

/// Lifetimes of shared state entries, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub typing_secs: u64,
    pub presence_secs: u64,
    pub live_session_secs: u64,
    /// Maximum assessment session duration.
    pub assessment_secs: u64,
    /// Retention of proctoring alerts.
    pub proctor_audit_secs: u64,
    /// Remaining time at which a timer warning is sent.
    pub timer_warning_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            typing_secs: 5,
            presence_secs: 300,
            live_session_secs: 4 * 3600,
            assessment_secs: 3 * 3600,
            proctor_audit_secs: 7 * 24 * 3600,
            timer_warning_secs: 300,
        }
    }
}

impl TtlConfig {
    fn apply_env_overrides(&mut self) {
        env_parse("CLASSCAST_TTL_TYPING", &mut self.typing_secs);
        env_parse("CLASSCAST_TTL_PRESENCE", &mut self.presence_secs);
        env_parse("CLASSCAST_TTL_LIVE_SESSION", &mut self.live_session_secs);
        env_parse("CLASSCAST_TTL_ASSESSMENT", &mut self.assessment_secs);
        env_parse("CLASSCAST_TTL_PROCTOR_AUDIT", &mut self.proctor_audit_secs);
        env_parse("CLASSCAST_TTL_TIMER_WARNING", &mut self.timer_warning_secs);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            ("typing_secs", self.typing_secs),
            ("presence_secs", self.presence_secs),
            ("live_session_secs", self.live_session_secs),
            ("assessment_secs", self.assessment_secs),
            ("proctor_audit_secs", self.proctor_audit_secs),
        ];
        for (name, secs) in all {
            if secs == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "ttl.{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn typing(&self) -> Duration {
        Duration::from_secs(self.typing_secs)
    }

    pub fn presence(&self) -> Duration {
        Duration::from_secs(self.presence_secs)
    }

    pub fn live_session(&self) -> Duration {
        Duration::from_secs(self.live_session_secs)
    }

    pub fn assessment(&self) -> Duration {
        Duration::from_secs(self.assessment_secs)
    }

    pub fn proctor_audit(&self) -> Duration {
        Duration::from_secs(self.proctor_audit_secs)
    }

    pub fn timer_warning(&self) -> Duration {
        Duration::from_secs(self.timer_warning_secs)
    }
}

/// Access directory configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// YAML fixture describing tenants and resources.
    pub fixture_path: Option<PathBuf>,
}

impl DirectoryConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("CLASSCAST_DIRECTORY") {
            self.fixture_path = Some(PathBuf::from(path));
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("CLASSCAST_METRICS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        env_parse("CLASSCAST_METRICS_BIND", &mut self.bind_addr);
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// SocketAddr as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_secret() -> Config {
        let mut config = Config::default();
        config.auth.jwt_secret = Some("dev-secret".to_string());
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(
            config.network.bind_addr.port(),
            classcast_protocol::DEFAULT_GATEWAY_PORT
        );
        assert_eq!(config.ttl.typing(), Duration::from_secs(5));
        assert_eq!(config.ttl.presence(), Duration::from_secs(300));
        assert_eq!(config.ttl.live_session(), Duration::from_secs(4 * 3600));
        assert_eq!(config.ttl.proctor_audit(), Duration::from_secs(604_800));
        assert_eq!(config.deployment.mode, DeploymentMode::Single);
        assert_eq!(config.store.mode, StoreMode::Memory);
    }

    #[test]
    fn test_defaults_need_a_secret() {
        assert!(Config::default().validate().is_err());
        with_secret().validate().unwrap();
    }

    #[test]
    fn test_multi_instance_requires_remote_store() {
        let mut config = with_secret();
        config.deployment.mode = DeploymentMode::Multi;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("store.mode=remote"));

        config.store.mode = StoreMode::Remote;
        assert!(config.validate().is_err());

        config.store.endpoint = Some("127.0.0.1:7411".to_string());
        config.validate().unwrap();
        assert_eq!(config.store.endpoint_addr().unwrap().port(), 7411);
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let mut config = with_secret();
        config.heartbeat.timeout_secs = config.heartbeat.interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = with_secret();
        config.ttl.typing_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rate_limit_overrides() {
        let mut limits = RateLimitsConfig::default();
        limits
            .commands
            .insert("raise_hand".to_string(), RateLimit::new(3, 10));
        limits
            .commands
            .insert("/live:raise_hand".to_string(), RateLimit::new(1, 5));

        assert_eq!(
            limits.override_for("/live", "raise_hand"),
            Some(RateLimit::new(1, 5))
        );
        assert_eq!(
            limits.override_for("/other", "raise_hand"),
            Some(RateLimit::new(3, 10))
        );
        assert_eq!(limits.override_for("/live", "stroke"), None);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
network:
  bind_addr: "0.0.0.0:8410"
store:
  mode: remote
  endpoint: "127.0.0.1:7411"
deployment:
  mode: multi
auth:
  jwt_secret: "s"
rate_limits:
  commands:
    poll_vote: {{ max_events: 2, window_secs: 1 }}
ttl:
  typing_secs: 8
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 8410);
        assert_eq!(config.deployment.mode, DeploymentMode::Multi);
        assert_eq!(config.ttl.typing_secs, 8);
        assert_eq!(config.ttl.presence_secs, 300);
        assert_eq!(
            config.rate_limits.override_for("/live", "poll_vote"),
            Some(RateLimit::new(2, 1))
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_secret_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  from-file  ").unwrap();

        let mut config = Config::default();
        config.auth.jwt_secret = Some("inline".to_string());
        config.auth.jwt_secret_file = Some(file.path().to_path_buf());
        config.load_secrets().unwrap();
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = with_secret();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.heartbeat.timeout_secs, config.heartbeat.timeout_secs);
    }
}

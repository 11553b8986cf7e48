//! Store daemon configuration.
//!
//! The daemon is configured from defaults overridden by environment
//! variables (`CLASSCAST_STORE_*`). Peer secret digests may also be read
//! from a file, one hex digest per line.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoreDaemonConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    /// Peers silent for this long are disconnected. Zero disables the check.
    pub idle_timeout_secs: u64,
    pub sweep_interval_ms: u64,
    pub channel_capacity: usize,
    /// SHA-256 hex digests of accepted peer secrets. Empty means open.
    pub peer_secret_digests: Vec<String>,
    pub secrets_file: Option<PathBuf>,
}

impl Default for StoreDaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], classcast_protocol::DEFAULT_STORE_PORT)),
            max_connections: 256,
            idle_timeout_secs: 0,
            sweep_interval_ms: 1000,
            channel_capacity: crate::memory::DEFAULT_CHANNEL_CAPACITY,
            peer_secret_digests: Vec::new(),
            secrets_file: None,
        }
    }
}

impl StoreDaemonConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("CLASSCAST_STORE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
        if let Ok(max) = std::env::var("CLASSCAST_STORE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
        if let Ok(secs) = std::env::var("CLASSCAST_STORE_IDLE_TIMEOUT") {
            if let Ok(n) = secs.parse() {
                self.idle_timeout_secs = n;
            }
        }
        if let Ok(ms) = std::env::var("CLASSCAST_STORE_SWEEP_MS") {
            if let Ok(n) = ms.parse::<u64>() {
                self.sweep_interval_ms = n.max(1);
            }
        }
        if let Ok(cap) = std::env::var("CLASSCAST_STORE_CHANNEL_CAPACITY") {
            if let Ok(n) = cap.parse() {
                self.channel_capacity = n;
            }
        }
        if let Ok(digests) = std::env::var("CLASSCAST_STORE_SECRET_DIGESTS") {
            self.peer_secret_digests.extend(
                digests
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from),
            );
        }
        if let Ok(path) = std::env::var("CLASSCAST_STORE_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Appends digests from the secrets file, if one is configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        let Some(path) = self.secrets_file.clone() else {
            return Ok(());
        };
        let content =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.len() != 64 || !line.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::ValidationError(format!(
                    "'{}' in {} is not a SHA-256 hex digest",
                    line,
                    path.display()
                )));
            }
            self.peer_secret_digests.push(line.to_string());
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => write!(f, "invalid store configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

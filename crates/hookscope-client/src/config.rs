//! Configuration for the hookscope client.
//!
//! Loaded from TOML (`$XDG_CONFIG_HOME/hookscope/config.toml` by default),
//! then overridden from `HOOKSCOPE_*` environment variables, then validated.
//! Every field has a default, so an absent file yields a working setup
//! pointed at a local broker.
//!
//! ```toml
//! [channel]
//! host = "broker.internal"
//! port = 6380
//! tls = true
//! cert_dir = "/etc/hookscope/certs"
//! tls_fallback = "fail_closed"
//!
//! [cache]
//! max_events = 2000
//! persistence_enabled = true
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Limits
// ============================================================================

/// Smallest capacity the cache ever shrinks to.
pub const MIN_MEMORY_EVENTS: usize = 100;

/// Largest capacity the cache may be configured with.
pub const MAX_MEMORY_EVENTS: usize = 10_000;

/// Default broker topic the hook scripts publish on.
pub const DEFAULT_TOPIC: &str = "hooksdata";

/// Names of the files expected inside a certificate bundle directory.
pub const CA_CERT_FILE: &str = "ca.crt";
pub const CLIENT_CERT_FILE: &str = "client.crt";
pub const CLIENT_KEY_FILE: &str = "client.key";

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Sections
// ============================================================================

/// What to do when TLS is on but the certificate bundle cannot be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsFallback {
    /// Connect with peer verification disabled and log a warning.
    #[default]
    Insecure,
    /// Refuse to connect.
    FailClosed,
}

/// Broker connection parameters.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub host: String,
    pub port: u16,
    /// Optional ACL username sent with AUTH.
    pub username: Option<String>,
    /// Broker credential; never logged.
    pub password: Option<String>,
    pub topic: String,
    pub tls: bool,
    /// Directory holding `ca.crt`, `client.crt` and `client.key`.
    pub cert_dir: Option<PathBuf>,
    pub tls_fallback: TlsFallback,
    /// SNI / verification name; defaults to `host`.
    pub server_name: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            topic: DEFAULT_TOPIC.to_string(),
            tls: false,
            cert_dir: None,
            tls_fallback: TlsFallback::default(),
            server_name: None,
            connect_timeout_secs: 10,
        }
    }
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `host:port` for logging and dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Name used for SNI and certificate verification.
    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("topic", &self.topic)
            .field("tls", &self.tls)
            .field("cert_dir", &self.cert_dir)
            .field("tls_fallback", &self.tls_fallback)
            .field("server_name", &self.server_name)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// In-memory cache sizing and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Soft ceiling, clamped to [`MIN_MEMORY_EVENTS`, `MAX_MEMORY_EVENTS`].
    pub max_events: usize,
    /// Events handed to the presentation layer; never above `max_events`.
    pub display_limit: usize,
    /// Mirror accepted events to the durable store.
    pub persistence_enabled: bool,
    /// Events older than this are purged regardless of cache size.
    pub max_event_age_secs: u64,
    /// Durable rows kept after each write.
    pub max_persisted_events: usize,
    /// How often memory pressure is sampled.
    pub pressure_check_interval_secs: u64,
    /// How often the age purge runs.
    pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_events: 1_000,
            display_limit: 500,
            persistence_enabled: false,
            max_event_age_secs: 30 * 60,
            max_persisted_events: 10_000,
            pressure_check_interval_secs: 30,
            purge_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn max_event_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.max_event_age_secs).unwrap_or(i64::MAX))
    }

    pub fn pressure_check_interval(&self) -> Duration {
        Duration::from_secs(self.pressure_check_interval_secs.max(1))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

/// Durable store location and write queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// SQLite file; defaults to `$XDG_DATA_HOME/hookscope/events.db`.
    pub database_path: Option<PathBuf>,
    /// Pending writes beyond this are dropped.
    pub queue_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            queue_capacity: 1_024,
        }
    }
}

impl PersistenceConfig {
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("hookscope")
                .join("events.db")
        })
    }
}

/// Bounded linear-backoff reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Attempt `n` waits `n * base_delay_ms`.
    pub base_delay_ms: u64,
    /// How long `Succeeded` stays visible before returning to `Idle`.
    pub success_grace_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            success_grace_ms: 3_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn success_grace(&self) -> Duration {
        Duration::from_millis(self.success_grace_ms)
    }
}

/// Health monitor sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    /// Snapshots kept for trend display.
    pub history_len: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            history_len: 60,
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(10))
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookscopeConfig {
    pub channel: ChannelConfig,
    pub cache: CacheConfig,
    pub persistence: PersistenceConfig,
    pub reconnect: ReconnectPolicy,
    pub monitor: MonitorConfig,
}

impl HookscopeConfig {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("hookscope").join("config.toml"))
    }

    /// Loads, applies environment overrides, and validates.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config
            .with_env_overrides(|key| std::env::var(key).ok())?
            .validated()
    }

    /// Parses a TOML file without overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Applies `HOOKSCOPE_*` overrides read through `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOOKSCOPE_HOST") {
            self.channel.host = host;
        }
        if let Some(port) = lookup("HOOKSCOPE_PORT") {
            self.channel.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "HOOKSCOPE_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(password) = lookup("HOOKSCOPE_PASSWORD") {
            self.channel.password = Some(password);
        }
        if let Some(topic) = lookup("HOOKSCOPE_TOPIC") {
            self.channel.topic = topic;
        }
        if let Some(dir) = lookup("HOOKSCOPE_CERT_DIR") {
            self.channel.cert_dir = Some(PathBuf::from(dir));
            self.channel.tls = true;
        }
        if let Some(db) = lookup("HOOKSCOPE_DB") {
            self.persistence.database_path = Some(PathBuf::from(db));
        }
        Ok(self)
    }

    /// Clamps sizes into range and rejects unusable values.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.channel.host.trim().is_empty() {
            return Err(ConfigError::Invalid("channel.host is empty".to_string()));
        }
        if self.channel.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("channel.topic is empty".to_string()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }

        self.cache.max_events = self
            .cache
            .max_events
            .clamp(MIN_MEMORY_EVENTS, MAX_MEMORY_EVENTS);
        self.cache.display_limit = self.cache.display_limit.clamp(1, self.cache.max_events);
        self.cache.max_persisted_events = self.cache.max_persisted_events.max(1);
        self.persistence.queue_capacity = self.persistence.queue_capacity.max(1);
        self.monitor.history_len = self.monitor.history_len.max(1);

        Ok(self)
    }
}

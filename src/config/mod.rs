//! Configuration Module
//!
//! TOML-based configuration for powerbridge with support for:
//! - Log level
//! - Embedded MQTT broker settings and static authentication
//! - HTTP endpoint settings
//! - Bridge settings (device topic, status timeout)
//! - Environment variable overrides (POWERBRIDGE__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Embedded MQTT broker
    pub mqtt: MqttConfig,
    /// HTTP endpoint
    pub http: HttpConfig,
    /// Command/status bridge
    pub bridge: BridgeConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Embedded MQTT broker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// TCP bind address
    #[serde(default = "default_mqtt_bind")]
    pub bind: SocketAddr,
    /// Maximum number of concurrent clients (0 = unbounded)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Keep alive in seconds enforced on clients that announce 0 (0 = honor it)
    #[serde(default = "default_keep_alive")]
    pub default_keep_alive: u16,
    /// Time allowed between accept and CONNECT
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-connection outbound packet queue capacity
    #[serde(default = "default_outbound_channel_capacity")]
    pub outbound_channel_capacity: usize,
    /// Static username/password authentication
    pub auth: AuthConfig,
}

fn default_mqtt_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}
fn default_max_connections() -> usize {
    1000
}
fn default_max_packet_size() -> usize {
    1024 * 1024
}
fn default_keep_alive() -> u16 {
    60
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_outbound_channel_capacity() -> usize {
    256
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            bind: default_mqtt_bind(),
            max_connections: default_max_connections(),
            max_packet_size: default_max_packet_size(),
            default_keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            outbound_channel_capacity: default_outbound_channel_capacity(),
            auth: AuthConfig::default(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow clients without a username when auth is enabled
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Plaintext password
    pub password: String,
}

/// HTTP endpoint configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// TCP bind address
    #[serde(default = "default_http_bind")]
    pub bind: SocketAddr,
    /// Base URL used in the help listing
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_http_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            public_url: default_public_url(),
        }
    }
}

/// Command/status bridge configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Device topic, the `<device>` in `cmnd/<device>/Power`
    #[serde(default = "default_device")]
    pub device: String,
    /// How long a status request waits for the device reply
    #[serde(default = "default_status_timeout", with = "humantime_serde")]
    pub status_timeout: Duration,
}

fn default_device() -> String {
    "main".to_string()
}
fn default_status_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            status_timeout: default_status_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `POWERBRIDGE__` prefix with double underscores for nesting:
    ///    - `POWERBRIDGE__HTTP__BIND=127.0.0.1:8081` overrides `http.bind`
    ///    - `POWERBRIDGE__BRIDGE__STATUS_TIMEOUT=5s` overrides `bridge.status_timeout`
    ///    - `POWERBRIDGE__MQTT__AUTH__ENABLED=true` overrides `mqtt.auth.enabled`
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("mqtt.bind", "0.0.0.0:1883")?
            .set_default("mqtt.max_connections", 1000)?
            .set_default("mqtt.max_packet_size", 1024 * 1024)?
            .set_default("mqtt.default_keep_alive", 60)?
            .set_default("mqtt.connect_timeout", "30s")?
            .set_default("mqtt.outbound_channel_capacity", 256)?
            .set_default("mqtt.auth.enabled", false)?
            .set_default("mqtt.auth.allow_anonymous", true)?
            .set_default("http.bind", "0.0.0.0:8080")?
            .set_default("http.public_url", "http://localhost:8080")?
            .set_default("bridge.device", "main")?
            .set_default("bridge.status_timeout", "10s")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("POWERBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let device = &self.bridge.device;
        if device.is_empty() {
            return Err(ConfigError::Validation(
                "bridge.device cannot be empty".to_string(),
            ));
        }
        if device.contains(['+', '#', '/', '\0']) {
            return Err(ConfigError::Validation(format!(
                "bridge.device '{}' must be a single topic level without wildcards",
                device
            )));
        }

        if self.bridge.status_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "bridge.status_timeout must be greater than zero".to_string(),
            ));
        }

        if self.mqtt.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "mqtt.max_packet_size must be greater than zero".to_string(),
            ));
        }

        if self.mqtt.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "mqtt.outbound_channel_capacity must be greater than zero".to_string(),
            ));
        }

        if self.mqtt.auth.enabled {
            for user in &self.mqtt.auth.users {
                if user.password.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' has empty password",
                        user.username
                    )));
                }
            }
        }

        if self.http.public_url.ends_with('/') {
            return Err(ConfigError::Validation(
                "http.public_url must not end with '/'".to_string(),
            ));
        }

        Ok(())
    }
}

//! Broker connection configuration
//!
//! Settings are loaded from a TOML file with a `[broker]` section holding the
//! per-connection [`ConnectionSettings`] and an optional `[runtime]` section
//! controlling the consumer loop. Credentials may be given inline or through
//! environment variables, which are resolved when a connection is attempted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Delivery guarantee requested for subscriptions and publishes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    AtMostOnce,
    AtLeastOnce,
    #[default]
    ExactlyOnce,
}

impl DeliveryGuarantee {
    /// Numeric QoS level as carried on the wire
    pub fn level(self) -> u8 {
        match self {
            DeliveryGuarantee::AtMostOnce => 0,
            DeliveryGuarantee::AtLeastOnce => 1,
            DeliveryGuarantee::ExactlyOnce => 2,
        }
    }
}

/// Top-level configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub broker: ConnectionSettings,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// Connection settings for a single broker session
///
/// Treated as immutable for the duration of a connection attempt; the manager
/// clones it into every connect sequence it starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSettings {
    /// Host name or IP address of the broker
    #[serde(default = "default_address")]
    pub address: String,
    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use TLS for the connection
    #[serde(default)]
    pub encrypted: bool,
    /// Optional `mqtt://host:port` or `mqtts://host:port` URL overriding address, port and encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_url: Option<String>,
    /// Delay before a connection attempt starts
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,
    /// Delay between transport construction and the protocol handshake
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Upper bound on the protocol handshake
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Keep-alive interval in seconds (0 disables keep-alive)
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Connect as soon as the manager is started
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Environment variable containing the username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    /// Environment variable containing the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// Topics subscribed after every successful connect, in order
    #[serde(default)]
    pub topics: Vec<String>,
    /// Delivery guarantee used for every subscription and publish
    #[serde(default)]
    pub qos: DeliveryGuarantee,
}

fn default_address() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_connect_delay_ms() -> u64 {
    500
}

fn default_settle_delay_ms() -> u64 {
    16 // one frame at 60Hz
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_keep_alive_secs() -> u64 {
    60
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            encrypted: false,
            broker_url: None,
            connect_delay_ms: default_connect_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            auto_connect: false,
            username: None,
            password: None,
            username_env: None,
            password_env: None,
            topics: Vec::new(),
            qos: DeliveryGuarantee::default(),
        }
    }
}

/// Consumer loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSection {
    /// Interval between ticks of the consumer loop
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Number of swap-and-drain passes per tick
    #[serde(default = "default_drain_passes")]
    pub drain_passes: usize,
}

fn default_tick_interval_ms() -> u64 {
    16
}

fn default_drain_passes() -> usize {
    2
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            drain_passes: default_drain_passes(),
        }
    }
}

impl RuntimeSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "tick_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.drain_passes == 0 {
            return Err(ConfigError::InvalidConfig(
                "drain_passes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Username and password presented during the handshake
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file, then normalize and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text, then normalize and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: BridgeConfig = toml::from_str(content)?;
        config.broker.apply_broker_url()?;
        config.broker.validate()?;
        config.runtime.validate()?;
        Ok(config)
    }
}

impl ConnectionSettings {
    /// Settings for a plain connection to `address:port`
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    /// Replace address, port and encryption with the values from `broker_url`, if set
    pub fn apply_broker_url(&mut self) -> Result<(), ConfigError> {
        let Some(broker_url) = self.broker_url.clone() else {
            return Ok(());
        };

        let url =
            Url::parse(&broker_url).map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.clone()))?;
        let encrypted = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(ConfigError::InvalidBrokerUrl(broker_url)),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.clone()))?;

        self.address = host.to_string();
        self.port = url.port().unwrap_or(if encrypted { 8883 } else { 1883 });
        self.encrypted = encrypted;
        Ok(())
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker address must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker port must be between 1 and 65535".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.keep_alive_secs != 0 && self.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be 0 (disabled) or at least 5".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Resolve credentials, preferring inline values over environment variables.
    /// Blank values count as absent.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = non_blank(self.username.clone())
            .or_else(|| non_blank(Self::get_env_var_optional(self.username_env.as_ref())))?;
        let password = non_blank(self.password.clone())
            .or_else(|| non_blank(Self::get_env_var_optional(self.password_env.as_ref())));

        Some(Credentials { username, password })
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

//! Configuration system for the resilient connection client
//!
//! Configuration is loaded from TOML. Every tunable has a default, so only the
//! endpoint URL is required.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Environment variable that overrides `endpoint.url` at load time
pub const URL_ENV_VAR: &str = "RESILINK_URL";

/// Main client configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    pub endpoint: EndpointSection,
    #[serde(default)]
    pub connection: ConnectionSection,
}

/// Endpoint section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointSection {
    /// WebSocket URL (`ws://` or `wss://`)
    pub url: String,
}

/// Connection manager tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSection {
    /// Reconnect attempts before giving up (default: 10)
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt in milliseconds (default: 1000)
    pub base_reconnect_delay_ms: u64,
    /// Upper bound for the reconnect delay in milliseconds (default: 30000)
    pub max_reconnect_delay_ms: u64,
    /// Ping interval in milliseconds, 0 disables heartbeats (default: 30000)
    pub heartbeat_interval_ms: u64,
    /// Time allowed for the transport to open in milliseconds (default: 10000)
    pub connection_timeout_ms: u64,
    /// Capacity of the outbound queue (default: 100)
    pub max_queue_size: usize,
    /// Per-subscriber event buffer before a slow subscriber starts lagging (default: 256)
    pub event_buffer: usize,
    /// Circuit breaker guarding connection attempts
    pub circuit_breaker: CircuitBreakerSection,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            base_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 10_000,
            max_queue_size: 100,
            event_buffer: 256,
            circuit_breaker: CircuitBreakerSection::for_connections(),
        }
    }
}

impl ConnectionSection {
    pub fn base_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.base_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Heartbeat period, `None` when heartbeats are disabled
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_queue_size must be greater than 0".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::InvalidConfig(
                "event_buffer must be greater than 0".to_string(),
            ));
        }
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.base_reconnect_delay_ms > self.max_reconnect_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "base_reconnect_delay_ms ({}) exceeds max_reconnect_delay_ms ({})",
                self.base_reconnect_delay_ms, self.max_reconnect_delay_ms
            )));
        }
        self.circuit_breaker.validate()
    }
}

/// Circuit breaker tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSection {
    /// Failures before the breaker opens (default: 5, connections use 3)
    pub failure_threshold: u32,
    /// Time the breaker stays open before probing, in milliseconds (default: 60000)
    pub recovery_timeout_ms: u64,
    /// Reserved for windowed failure counting
    pub monitoring_period_ms: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            monitoring_period_ms: 10_000,
        }
    }
}

impl CircuitBreakerSection {
    /// Defaults used when the breaker guards connection attempts
    pub fn for_connections() -> Self {
        Self {
            failure_threshold: 3,
            ..Self::default()
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
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
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LinkConfig {
    /// Build a configuration for an endpoint with default tunables
    pub fn for_endpoint<S: Into<String>>(url: S) -> Self {
        Self {
            endpoint: EndpointSection { url: url.into() },
            connection: ConnectionSection::default(),
        }
    }

    /// Load configuration from TOML file, applying the `RESILINK_URL` override
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: LinkConfig = toml::from_str(content)?;

        if let Ok(url) = std::env::var(URL_ENV_VAR) {
            config.endpoint.url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate endpoint and tunables
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint_url(&self.endpoint.url)?;
        self.connection.validate()
    }
}

/// Validate that an endpoint is a ws:// or wss:// URL with a host
pub fn validate_endpoint_url(endpoint: &str) -> Result<Url, ConfigError> {
    let url =
        Url::parse(endpoint).map_err(|e| ConfigError::InvalidUrl(format!("{endpoint}: {e}")))?;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConfigError::InvalidUrl(format!(
            "{endpoint}: scheme must be ws or wss"
        )));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl(format!("{endpoint}: missing host")));
    }

    Ok(url)
}

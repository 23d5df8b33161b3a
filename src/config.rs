//! Application configuration
//!
//! Configuration is loaded from a TOML file with per-section defaults, so a
//! partial file (or none at all) still yields a runnable configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub hub: HubConfig,
    pub filter: FilterConfig,
    pub pipeline: PipelineConfig,
    pub forwarder: ForwarderConfig,
    pub api: ApiConfig,
    pub health: HealthConfig,
}

/// Hub connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// WebSocket endpoint of the hub event API
    pub url: String,
    /// Bearer token presented during the auth handshake
    pub access_token: String,
    /// Event types to subscribe to; empty subscribes to all events
    pub subscribed_event_types: Vec<String>,
    /// Liveness probe interval
    pub heartbeat_interval_ms: u64,
    /// How long to wait for the hub to accept authentication
    pub auth_timeout_ms: u64,
    /// First reconnect delay; doubled per consecutive failure
    pub reconnect_base_delay_ms: u64,
    /// Upper bound on the reconnect delay
    pub reconnect_max_delay_ms: u64,
    /// Consecutive reconnect failures tolerated before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: "ws://homeassistant.local:8123/api/websocket".to_string(),
            access_token: String::new(),
            subscribed_event_types: Vec::new(),
            heartbeat_interval_ms: 30_000,
            auth_timeout_ms: 10_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

/// Filter engine thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Sliding window for per-entity frequency counting
    pub frequency_window_seconds: u64,
    /// Events per window above which an entity is rate limited
    pub frequency_threshold: usize,
    /// Entity domains examined by the significance and active-hours stages
    pub priority_entity_domains: Vec<String>,
    /// Start of the active window, hour of day [0, 24]
    pub active_hours_start: u32,
    /// End of the active window, hour of day [0, 24]
    pub active_hours_end: u32,
    /// Offset applied to UTC timestamps before the active-hours check
    pub active_hours_utc_offset_minutes: i32,
    /// Probability that an otherwise undecided event is kept
    pub sampling_rate: f64,
    /// Fixed RNG seed for the sampling stage; None seeds from entropy
    pub sampling_seed: Option<u64>,
    /// Maximum number of entities tracked in the decision context map
    pub context_cache_size: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            frequency_window_seconds: 60,
            frequency_threshold: 10,
            priority_entity_domains: vec![
                "sensor".to_string(),
                "switch".to_string(),
                "light".to_string(),
                "lock".to_string(),
                "alarm".to_string(),
            ],
            active_hours_start: 6,
            active_hours_end: 22,
            active_hours_utc_offset_minutes: 0,
            sampling_rate: 0.1,
            sampling_seed: None,
            context_cache_size: 10_000,
        }
    }
}

/// Worker pool and queue sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent event workers; 0 means one per CPU core
    pub worker_pool_size: usize,
    /// Bounded queue between the read loop and the workers
    pub queue_capacity: usize,
    /// How long shutdown waits for in-flight work before abandoning it
    pub shutdown_grace_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 0,
            queue_capacity: 256,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl PipelineConfig {
    /// Worker pool size with the CPU-count default resolved
    pub fn effective_worker_pool_size(&self) -> usize {
        if self.worker_pool_size == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_pool_size
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Broker and store collaborator endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Append-log broker base URL
    pub broker_url: String,
    /// Topic the kept events are published to
    pub topic: String,
    /// Query store base URL
    pub store_url: String,
    /// Per-request timeout for both collaborators
    pub request_timeout_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            broker_url: "http://127.0.0.1:9092".to_string(),
            topic: "hub-events".to_string(),
            store_url: "http://127.0.0.1:8095".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

impl ForwarderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Stats/health read API settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Address the read API binds to
    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8093".to_string(),
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between aggregator polls
    pub poll_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML, or
    /// `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.url.is_empty() {
            return Err(ConfigError::ValidationError(
                "hub.url must not be empty".to_string(),
            ));
        }
        if !self.hub.url.starts_with("ws://") && !self.hub.url.starts_with("wss://") {
            return Err(ConfigError::ValidationError(format!(
                "hub.url must be a ws:// or wss:// endpoint, got '{}'",
                self.hub.url
            )));
        }
        if self.hub.max_reconnect_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "hub.max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.hub.reconnect_base_delay_ms == 0
            || self.hub.reconnect_base_delay_ms > self.hub.reconnect_max_delay_ms
        {
            return Err(ConfigError::ValidationError(format!(
                "hub reconnect delays must satisfy 0 < base ({}) <= max ({})",
                self.hub.reconnect_base_delay_ms, self.hub.reconnect_max_delay_ms
            )));
        }
        if self.hub.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "hub.heartbeat_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.hub.auth_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "hub.auth_timeout_ms must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.filter.sampling_rate) {
            return Err(ConfigError::ValidationError(format!(
                "filter.sampling_rate must be within [0, 1], got {}",
                self.filter.sampling_rate
            )));
        }
        if self.filter.frequency_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "filter.frequency_threshold must be at least 1".to_string(),
            ));
        }
        if self.filter.frequency_window_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "filter.frequency_window_seconds must be at least 1".to_string(),
            ));
        }
        if self.filter.active_hours_start > 24 || self.filter.active_hours_end > 24 {
            return Err(ConfigError::ValidationError(format!(
                "filter active hours must be within [0, 24], got {}..{}",
                self.filter.active_hours_start, self.filter.active_hours_end
            )));
        }
        if self.filter.context_cache_size == 0 {
            return Err(ConfigError::ValidationError(
                "filter.context_cache_size must be at least 1".to_string(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.health.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "health.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.api.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "api.listen_addr is not a valid socket address: '{}'",
                self.api.listen_addr
            )));
        }
        Ok(())
    }
}

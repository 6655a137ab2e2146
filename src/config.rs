//! Configuration management for Gatekeeper.
//!
//! Configuration is static per deployment: it is read once at startup from an
//! optional YAML file layered under `GATEKEEPER__*` environment variables, and
//! any invalid value aborts startup.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::LimitsConfig;

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limit tiers
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Abuse detection thresholds
    #[serde(default)]
    pub abuse: AbuseConfig,

    /// Audit event emission
    #[serde(default)]
    pub events: EventsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection string; without one the service runs on in-process
    /// counters only
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every counter key written to Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Budget for one shared-store increment, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Budget for establishing a Redis connection, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How often the health check probes the shared store
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// How often expired fallback counters are evicted
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            health_check_interval_secs: default_health_check_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_key_prefix() -> String {
    "gatekeeper:rl:".to_string()
}

fn default_timeout_ms() -> u64 {
    75
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    30
}

/// Abuse detection thresholds. All of them are tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseConfig {
    /// Trailing window the heuristics look at, in seconds
    #[serde(default = "default_abuse_window")]
    pub window_secs: u64,

    /// How long per-identity history is kept, in seconds
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Blocked fraction above which `high_block_ratio` fires
    #[serde(default = "default_block_ratio")]
    pub block_ratio_threshold: f64,

    /// Decisions needed before the block ratio is considered
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Blocked requests in the window at which `excessive_blocks` fires
    #[serde(default = "default_block_count")]
    pub block_count_threshold: usize,

    /// Distinct IPs per user above which `ip_fanout` fires
    #[serde(default = "default_ip_fanout")]
    pub ip_fanout_threshold: usize,

    /// Distinct IPs per user at which the fan-out is critical on its own
    #[serde(default = "default_critical_ip_fanout")]
    pub critical_ip_fanout: usize,

    /// Consecutive requests inspected for `burst_pattern`
    #[serde(default = "default_burst_min_requests")]
    pub burst_min_requests: usize,

    /// Mean inter-arrival time under which those requests count as a burst,
    /// in milliseconds
    #[serde(default = "default_burst_interval")]
    pub burst_max_interval_ms: u64,

    /// Cap on observations kept per identity
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// How often idle histories are evicted, in seconds
    #[serde(default = "default_abuse_sweep")]
    pub sweep_interval_secs: u64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            window_secs: default_abuse_window(),
            retention_secs: default_retention(),
            block_ratio_threshold: default_block_ratio(),
            min_samples: default_min_samples(),
            block_count_threshold: default_block_count(),
            ip_fanout_threshold: default_ip_fanout(),
            critical_ip_fanout: default_critical_ip_fanout(),
            burst_min_requests: default_burst_min_requests(),
            burst_max_interval_ms: default_burst_interval(),
            max_history: default_max_history(),
            sweep_interval_secs: default_abuse_sweep(),
        }
    }
}

impl AbuseConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn burst_max_interval(&self) -> Duration {
        Duration::from_millis(self.burst_max_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_abuse_window() -> u64 {
    300
}

fn default_retention() -> u64 {
    3600
}

fn default_block_ratio() -> f64 {
    0.5
}

fn default_min_samples() -> usize {
    5
}

fn default_block_count() -> usize {
    10
}

fn default_ip_fanout() -> usize {
    3
}

fn default_critical_ip_fanout() -> usize {
    10
}

fn default_burst_min_requests() -> usize {
    20
}

fn default_burst_interval() -> u64 {
    50
}

fn default_max_history() -> usize {
    1000
}

fn default_abuse_sweep() -> u64 {
    60
}

/// Audit event emission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Emit events at all
    #[serde(default = "default_events_enabled")]
    pub enabled: bool,

    /// Remaining-quota fraction at or below which an allowed request emits a
    /// warning event
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Events buffered before new ones are dropped
    #[serde(default = "default_event_buffer")]
    pub buffer_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: default_events_enabled(),
            warning_threshold: default_warning_threshold(),
            buffer_size: default_event_buffer(),
        }
    }
}

fn default_events_enabled() -> bool {
    true
}

fn default_warning_threshold() -> f64 {
    0.1
}

fn default_event_buffer() -> usize {
    1024
}

impl GatekeeperConfig {
    /// Load configuration from an optional YAML file plus `GATEKEEPER__*`
    /// environment variables (`GATEKEEPER__STORE__REDIS_URL`, ...).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GATEKEEPER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;

        let store = &self.store;
        if store.timeout_ms == 0 || store.connect_timeout_ms == 0 {
            return Err(GatekeeperError::Config("store timeouts must be > 0".into()));
        }
        if store.health_check_interval_secs == 0 || store.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config("store intervals must be > 0".into()));
        }

        let abuse = &self.abuse;
        if abuse.window_secs == 0 || abuse.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config("abuse intervals must be > 0".into()));
        }
        if abuse.retention_secs < abuse.window_secs {
            return Err(GatekeeperError::Config(
                "abuse retention must cover the detection window".into(),
            ));
        }
        if !(abuse.block_ratio_threshold > 0.0 && abuse.block_ratio_threshold <= 1.0) {
            return Err(GatekeeperError::Config(
                "abuse.block_ratio_threshold must be in (0, 1]".into(),
            ));
        }
        if abuse.critical_ip_fanout <= abuse.ip_fanout_threshold {
            return Err(GatekeeperError::Config(
                "abuse.critical_ip_fanout must exceed ip_fanout_threshold".into(),
            ));
        }
        if abuse.burst_min_requests < 2 || abuse.max_history < abuse.burst_min_requests {
            return Err(GatekeeperError::Config(
                "abuse.max_history must hold at least burst_min_requests (>= 2)".into(),
            ));
        }

        let events = &self.events;
        if !(0.0..1.0).contains(&events.warning_threshold) {
            return Err(GatekeeperError::Config(
                "events.warning_threshold must be in [0, 1)".into(),
            ));
        }
        if events.buffer_size == 0 {
            return Err(GatekeeperError::Config("events.buffer_size must be > 0".into()));
        }

        Ok(())
    }
}

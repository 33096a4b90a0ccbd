//! Sync layer configuration.

use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 600_000;
const MAX_BROADCAST_CAPACITY: usize = 1 << 16;

/// Configuration for [`SyncClient`](crate::SyncClient) and its parts.
///
/// Durations are stored in milliseconds so the struct reads naturally from
/// JSON or TOML; use the accessor methods to get [`Duration`]s.
///
/// ```rust
/// use verdant_sync::SyncConfig;
///
/// let config = SyncConfig::builder()
///     .ws_url("wss://sync.verdant.example/ws")
///     .api_url("https://api.verdant.example")
///     .alert_after(5)
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Push channel endpoint (`ws://` or `wss://`).
    pub ws_url: String,

    /// REST API base URL (`http://` or `https://`), without a trailing `/api`.
    pub api_url: String,

    /// Transport connect timeout.
    pub connect_timeout_ms: u64,

    /// Time allowed between sending `auth` and receiving `auth:ok`.
    pub handshake_timeout_ms: u64,

    /// A connection that receives nothing for this long is considered lost.
    pub idle_timeout_ms: u64,

    /// Total timeout of one REST request.
    pub request_timeout_ms: u64,

    /// First reconnect delay.
    pub backoff_initial_ms: u64,

    /// Reconnect delay ceiling; retries continue at this interval forever.
    pub backoff_max_ms: u64,

    /// Growth factor between consecutive reconnect delays.
    pub backoff_multiplier: f64,

    /// Jitter as a fraction of the delay (0.0 to 1.0).
    pub backoff_jitter: f64,

    /// Consecutive failed attempts before the disconnected alert is raised.
    pub alert_after_attempts: u32,

    /// Buffer size of each cache's change channel.
    pub broadcast_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:3001/ws".to_string(),
            api_url: "http://localhost:3000".to_string(),
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 90_000,
            request_timeout_ms: 30_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            backoff_jitter: 0.3,
            alert_after_attempts: 5,
            broadcast_capacity: crate::cache::DEFAULT_CHANGE_CAPACITY,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reconnect policy. Never gives up: `max_elapsed_time` is unset.
    pub fn backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.backoff_initial_ms);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: Duration::from_millis(self.backoff_max_ms),
            multiplier: self.backoff_multiplier,
            randomization_factor: self.backoff_jitter,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(SyncError::InvalidConfig(format!(
                "ws_url must start with ws:// or wss:// (got '{}')",
                self.ws_url
            )));
        }

        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(SyncError::InvalidConfig(format!(
                "api_url must start with http:// or https:// (got '{}')",
                self.api_url
            )));
        }

        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&value) {
                return Err(SyncError::InvalidConfig(format!(
                    "{name} must be between {MIN_TIMEOUT_MS} and {MAX_TIMEOUT_MS} (got {value})"
                )));
            }
        }

        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(SyncError::InvalidConfig(format!(
                "backoff_initial_ms must be in 1..={} (got {})",
                self.backoff_max_ms, self.backoff_initial_ms
            )));
        }

        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(format!(
                "backoff_multiplier must be at least 1.0 (got {})",
                self.backoff_multiplier
            )));
        }

        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(SyncError::InvalidConfig(format!(
                "backoff_jitter must be between 0.0 and 1.0 (got {})",
                self.backoff_jitter
            )));
        }

        if self.alert_after_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "alert_after_attempts must be at least 1".to_string(),
            ));
        }

        if self.broadcast_capacity == 0 || self.broadcast_capacity > MAX_BROADCAST_CAPACITY {
            return Err(SyncError::InvalidConfig(format!(
                "broadcast_capacity must be between 1 and {MAX_BROADCAST_CAPACITY} (got {})",
                self.broadcast_capacity
            )));
        }

        Ok(())
    }
}

pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    #[must_use]
    pub fn ws_url(mut self, url: impl Into<String>) -> Self {
        self.config.ws_url = url.into();
        self
    }

    #[must_use]
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = millis(timeout);
        self
    }

    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = millis(timeout);
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_ms = millis(timeout);
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = millis(timeout);
        self
    }

    #[must_use]
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.backoff_initial_ms = millis(initial);
        self.config.backoff_max_ms = millis(max);
        self
    }

    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.config.backoff_jitter = jitter;
        self
    }

    #[must_use]
    pub fn alert_after(mut self, attempts: u32) -> Self {
        self.config.alert_after_attempts = attempts;
        self
    }

    #[must_use]
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.config.broadcast_capacity = capacity;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

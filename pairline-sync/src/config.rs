//! Client-side configuration.
//!
//! `SyncConfig` has sensible defaults, can be loaded from a TOML file, and
//! honours a few environment overrides for the external endpoints:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PAIRLINE_CHANNEL_URL` | `channel_url` |
//! | `PAIRLINE_API_URL` | `api_url` |
//! | `PAIRLINE_GRANT_URL` | `grant_url` |

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_CHANNEL_URL: &str = "PAIRLINE_CHANNEL_URL";
pub const ENV_API_URL: &str = "PAIRLINE_API_URL";
pub const ENV_GRANT_URL: &str = "PAIRLINE_GRANT_URL";

/// Configuration for one participant's synchronization core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Relay WebSocket endpoint (session id is appended as a path segment).
    pub channel_url: String,
    /// REST-like session API base URL.
    pub api_url: Option<String>,
    /// Media credential issuance endpoint. Defaults to the session API.
    pub grant_url: Option<String>,
    pub transport: TransportConfig,
    pub document: DocumentConfig,
    pub signals: SignalConfig,
    pub media: MediaConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_url: "ws://127.0.0.1:9090".to_string(),
            api_url: None,
            grant_url: None,
            transport: TransportConfig::default(),
            document: DocumentConfig::default(),
            signals: SignalConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parse from TOML text. Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_CHANNEL_URL) {
            self.channel_url = url;
        }
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_url = Some(url);
        }
        if let Some(url) = lookup(ENV_GRANT_URL) {
            self.grant_url = Some(url);
        }
    }
}

/// Channel transport timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// Delay before each re-subscribe attempt.
    pub reconnect_delay_ms: u64,
    /// Consecutive failed attempts before giving up.
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    /// Silence after which the link is treated as dropped.
    pub heartbeat_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            reconnect_delay_ms: 2_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 45_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Quiet period before a durable save.
    pub save_debounce_ms: u64,
    /// Upper bound for the final save when leaving.
    pub final_save_timeout_ms: u64,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: 2_000,
            final_save_timeout_ms: 3_000,
        }
    }
}

impl DocumentConfig {
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn final_save_timeout(&self) -> Duration {
        Duration::from_millis(self.final_save_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Idle window after the last keystroke before `typing=false`.
    pub typing_idle_ms: u64,
    /// Remote typing flags expire after this long without a refresh.
    pub remote_typing_ttl_ms: u64,
    /// While typing continues, `typing=true` is re-sent this often. Must
    /// leave room for `typing_idle_ms` inside `remote_typing_ttl_ms`.
    pub typing_refresh_ms: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            typing_idle_ms: 1_000,
            remote_typing_ttl_ms: 3_000,
            typing_refresh_ms: 1_000,
        }
    }
}

impl SignalConfig {
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn remote_typing_ttl(&self) -> Duration {
        Duration::from_millis(self.remote_typing_ttl_ms)
    }

    pub fn typing_refresh(&self) -> Duration {
        Duration::from_millis(self.typing_refresh_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Audio metering period.
    pub meter_interval_ms: u64,
    /// Samples read per metering tick.
    pub meter_window: usize,
    /// RMS level at or above which the local participant is speaking.
    pub speaking_threshold: f32,
    /// Quiet ticks needed before speaking is cleared.
    pub speaking_release_ticks: u32,
    /// Publish camera on call join (microphone is always published).
    pub publish_camera: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            meter_interval_ms: 50,
            meter_window: 480,
            speaking_threshold: 0.02,
            speaking_release_ticks: 6,
            publish_camera: true,
        }
    }
}

impl MediaConfig {
    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms)
    }
}

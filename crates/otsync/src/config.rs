use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::SyncResult;

/// How messages are framed on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// One JSON object per text frame
    #[default]
    Json,
    /// JSON wrapped in a lib0 var-string, sent as a binary frame
    Lib0,
}

/// Exponential backoff settings for the socket reconnect loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            factor: 1.3,
            max_delay_ms: 10_000,
            max_retries: None,
        }
    }
}

/// Settings for a [`SyncEngine`](crate::SyncEngine)
///
/// Every field has a default, so a config file only needs to name what it
/// overrides:
///
/// ```
/// let config = otsync::EngineConfig::from_json_str(r#"{"url": "ws://localhost:3000/socket"}"#).unwrap();
/// assert_eq!(config.request_timeout(), std::time::Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub url: String,
    pub request_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub wire_format: WireFormat,
    pub presence_heartbeat_ms: u64,
    pub presence_stale_after_ms: u64,
    pub history_max_size: usize,
    pub user_id: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/socket".to_string(),
            request_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
            wire_format: WireFormat::default(),
            presence_heartbeat_ms: 10_000,
            presence_stale_after_ms: 30_000,
            history_max_size: 100,
            user_id: None,
        }
    }
}

impl EngineConfig {
    /// Create a config with default settings for the given socket URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Parse a config from JSON, filling omitted fields with defaults
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_millis(self.presence_heartbeat_ms)
    }

    pub fn presence_stale_after(&self) -> Duration {
        Duration::from_millis(self.presence_stale_after_ms)
    }
}

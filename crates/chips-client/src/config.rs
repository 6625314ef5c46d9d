use std::path::Path;
use std::time::Duration;

use chips_common::{Error, Result};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3001/ws";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_DELAY_MAX_MS: u64 = 5_000;
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_FAILURE_GRACE_MS: u64 = 5_000;
pub const DEFAULT_DEDUP_CAPACITY: usize = 1_000;
pub const DEFAULT_LATENCY_WINDOW: usize = 100;
pub const DEFAULT_IMAGE_COMPRESS_THRESHOLD: usize = 1024 * 1024;
pub const DEFAULT_IMAGE_QUALITY: f32 = 0.7;
pub const DEFAULT_IMAGE_MAX_EDGE: u32 = 1024;

fn default_ice_servers() -> Vec<String> {
    [
        "stun:stun.l.google.com:19302",
        "stun:stun1.l.google.com:19302",
        "stun:stun2.l.google.com:19302",
        "stun:stun3.l.google.com:19302",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Tunables for one chat client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub ice_servers: Vec<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub reconnect_delay_max_ms: u64,
    pub probe_interval_ms: u64,
    pub failure_grace_ms: u64,
    pub dedup_capacity: usize,
    pub latency_window: usize,
    pub image_compress_threshold_bytes: usize,
    pub image_quality: f32,
    pub image_max_edge: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            ice_servers: default_ice_servers(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            reconnect_delay_max_ms: DEFAULT_RECONNECT_DELAY_MAX_MS,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            failure_grace_ms: DEFAULT_FAILURE_GRACE_MS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            latency_window: DEFAULT_LATENCY_WINDOW,
            image_compress_threshold_bytes: DEFAULT_IMAGE_COMPRESS_THRESHOLD,
            image_quality: DEFAULT_IMAGE_QUALITY,
            image_max_edge: DEFAULT_IMAGE_MAX_EDGE,
        }
    }
}

impl ClientConfig {
    /// Load from a JSON file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(self.server_url.trim())
            .map_err(|e| Error::config(format!("invalid server_url `{}`: {e}", self.server_url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "server_url must be ws:// or wss://, got `{}`",
                self.server_url
            )));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(Error::config("max_reconnect_attempts must be at least 1"));
        }
        if self.reconnect_delay_ms == 0 || self.reconnect_delay_max_ms < self.reconnect_delay_ms {
            return Err(Error::config(
                "reconnect delays must be non-zero and max >= initial",
            ));
        }
        if self.probe_interval_ms == 0 {
            return Err(Error::config("probe_interval_ms must be non-zero"));
        }
        if self.dedup_capacity == 0 || self.latency_window == 0 {
            return Err(Error::config("dedup_capacity and latency_window must be non-zero"));
        }
        if !(self.image_quality > 0.0 && self.image_quality <= 1.0) {
            return Err(Error::config("image_quality must be in (0, 1]"));
        }
        if self.image_max_edge == 0 {
            return Err(Error::config("image_max_edge must be non-zero"));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn failure_grace(&self) -> Duration {
        Duration::from_millis(self.failure_grace_ms)
    }
}

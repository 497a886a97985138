//! Transport configuration, loaded from TOML with fallback to defaults.

use crate::classify::{MessageCategory, MessageRule};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Rate/burst pair for one token bucket, in bandwidth units.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RateBurst {
    /// Sustained units per second.
    pub rate: f64,
    /// Burst capacity in units.
    pub burst: f64,
}

/// Heartbeat and failure-detection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between liveness probes, milliseconds.
    pub interval_ms: u64,
    /// Base adaptive timeout, milliseconds.
    pub base_timeout_ms: u64,
    /// Cap on the adaptive timeout multiplier.
    pub timeout_multiplier_cap: u32,
    /// Consecutive probe failures before the connection is flagged
    /// degraded; twice this count makes it eligible for a health-check
    /// forced disconnect.
    pub max_consecutive_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            base_timeout_ms: 5_000,
            timeout_multiplier_cap: 4,
            max_consecutive_failures: 3,
        }
    }
}

/// Bandwidth-shaping settings.
///
/// `categories` overrides the Normal-mode per-category partition; categories
/// not listed fall back to a fixed share of the global limit.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Global sustained rate, units per second.
    pub global_rate: f64,
    /// Global burst capacity, units.
    pub global_burst: f64,
    /// Explicit per-category rate/burst overrides for Normal mode.
    pub categories: HashMap<MessageCategory, RateBurst>,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            global_rate: 16_384.0,
            global_burst: 32_768.0,
            categories: HashMap::new(),
        }
    }
}

/// Outbound-queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Whether messages are queued while disconnected.
    pub enabled: bool,
    /// Maximum queued entries across all priorities.
    pub max_size: usize,
    /// Entries older than this are dropped before replay, milliseconds.
    pub max_age_ms: u64,
    /// Entries replayed per cycle once reconnected.
    pub replay_batch: usize,
    /// Pause between replay batches, milliseconds.
    pub replay_pause_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 256,
            max_age_ms: 30_000,
            replay_batch: 8,
            replay_pause_ms: 50,
        }
    }
}

/// Connect/disconnect/reconnect timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect attempts before giving up permanently.
    pub max_attempts: u32,
    /// Wall-clock bound on a single raw connect, milliseconds.
    pub connect_timeout_ms: u64,
    /// Bounded wait for disconnect acknowledgment, milliseconds.
    pub disconnect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            connect_timeout_ms: 5_000,
            disconnect_timeout_ms: 2_000,
        }
    }
}

/// Top-level transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetConfig {
    /// Server address as `host:port`.
    pub server_addr: String,
    /// Inbound events drained per poll cycle.
    pub poll_budget: usize,
    /// Heartbeat and failure detection.
    pub heartbeat: HeartbeatConfig,
    /// Bandwidth shaping.
    pub bandwidth: BandwidthConfig,
    /// Offline queueing.
    pub queue: QueueConfig,
    /// Connection timing.
    pub reconnect: ReconnectConfig,
    /// Additional message-classification rules layered over the defaults.
    pub rules: Vec<MessageRule>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7777".to_string(),
            poll_budget: 32,
            heartbeat: HeartbeatConfig::default(),
            bandwidth: BandwidthConfig::default(),
            queue: QueueConfig::default(),
            reconnect: ReconnectConfig::default(),
            rules: Vec::new(),
        }
    }
}

impl NetConfig {
    /// Load configuration from an explicit path, falling back to defaults on
    /// errors.
    pub fn load_from_path(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<NetConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    NetConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                } else {
                    warn!(
                        "Network config not found at {}. Using defaults",
                        path.display()
                    );
                }
                NetConfig::default()
            }
        }
    }

    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    /// Base adaptive timeout as a duration.
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.base_timeout_ms)
    }

    /// Queue max age as a duration.
    pub fn queue_max_age(&self) -> Duration {
        Duration::from_millis(self.queue.max_age_ms)
    }

    /// Replay pause as a duration.
    pub fn replay_pause(&self) -> Duration {
        Duration::from_millis(self.queue.replay_pause_ms)
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect.connect_timeout_ms)
    }

    /// Disconnect-acknowledgment timeout as a duration.
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect.disconnect_timeout_ms)
    }
}

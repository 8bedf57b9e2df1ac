//! Runtime configuration.
//!
//! Loadable from a TOML file; every field has a default matching the
//! protocol constants, so `Config::default()` is a working configuration
//! for a standard local proxy setup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("listener ports must be distinct: {0}")]
    DuplicatePort(u16),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// SOCKS proxy and listener layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// SOCKS5 proxy host the overlay exposes.
    #[serde(default = "default_socks_host")]
    pub socks_host: String,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// P1: PING, MESSAGE and FRIEND_REQUEST frames.
    #[serde(default = "default_ping_port")]
    pub ping_port: u16,
    /// P2: TAP presence beacons.
    #[serde(default = "default_tap_port")]
    pub tap_port: u16,
    /// P3: PONG frames.
    #[serde(default = "default_pong_port")]
    pub pong_port: u16,
    /// P4: PING_ACK and MESSAGE_ACK frames.
    #[serde(default = "default_ack_port")]
    pub ack_port: u16,
    /// Largest frame a listener will aggregate before dropping the peer.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the core database. Empty = in-memory (tests).
    #[serde(default)]
    pub data_dir: String,
}

/// Every protocol timing knob, defaulting to the shipped constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Retry worker tick.
    #[serde(default = "default_retry_tick_secs")]
    pub retry_tick_secs: u64,
    /// Total send attempts before an outbox row is marked failed.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    /// How long the instant path waits for a Pong on the dial connection.
    #[serde(default = "default_instant_pong_wait_secs")]
    pub instant_pong_wait_secs: u64,
    /// Pong-via-listener backoff: 2 s, 4 s, 8 s, capped here.
    #[serde(default = "default_pong_backoff_cap_secs")]
    pub pong_backoff_cap_secs: u64,
    #[serde(default = "default_pong_backoff_attempts")]
    pub pong_backoff_attempts: u32,
    /// Minimum spacing between send attempts for one row.
    #[serde(default = "default_inter_attempt_min_secs")]
    pub inter_attempt_min_secs: u64,
    /// Gap between Taps in a broadcast burst.
    #[serde(default = "default_tap_gap_ms")]
    pub tap_gap_ms: u64,
    /// Download watchdog budget.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Auto-download retries before a Ping needs manual action.
    #[serde(default = "default_max_auto_retries")]
    pub max_auto_retries: u32,
    /// Start downloads automatically when a Ping is accepted.
    #[serde(default = "default_true")]
    pub auto_download: bool,
    /// Ping / message id retention and Ping expiry window (days).
    #[serde(default = "default_ping_retention_days")]
    pub ping_retention_days: u32,
    /// Pong id retention window (days).
    #[serde(default = "default_pong_retention_days")]
    pub pong_retention_days: u32,
    /// MESSAGE_ACK emission retries.
    #[serde(default = "default_ack_retry_attempts")]
    pub ack_retry_attempts: u32,
    /// Overlay reconnection backoff.
    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: u64,
    #[serde(default = "default_reconnect_cap_secs")]
    pub reconnect_cap_secs: u64,
    #[serde(default = "default_reconnect_min_gap_secs")]
    pub reconnect_min_gap_secs: u64,
    /// SOCKS health probe cadence and failure policy.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_fail_window_secs")]
    pub probe_fail_window_secs: u64,
    #[serde(default = "default_probe_fail_limit")]
    pub probe_fail_limit: u32,
    /// How long an inbound connection stays parked for the instant path.
    #[serde(default = "default_parked_window_secs")]
    pub parked_window_secs: u64,
}

fn default_socks_host() -> String {
    "127.0.0.1".to_string()
}
fn default_socks_port() -> u16 {
    9050
}
fn default_ping_port() -> u16 {
    8080
}
fn default_tap_port() -> u16 {
    9151
}
fn default_pong_port() -> u16 {
    9152
}
fn default_ack_port() -> u16 {
    9153
}
fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_dial_timeout_secs() -> u64 {
    30
}
fn default_retry_tick_secs() -> u64 {
    5
}
fn default_max_send_attempts() -> u32 {
    10
}
fn default_instant_pong_wait_secs() -> u64 {
    4
}
fn default_pong_backoff_cap_secs() -> u64 {
    10
}
fn default_pong_backoff_attempts() -> u32 {
    5
}
fn default_inter_attempt_min_secs() -> u64 {
    3
}
fn default_tap_gap_ms() -> u64 {
    150
}
fn default_download_timeout_secs() -> u64 {
    45
}
fn default_max_auto_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_ping_retention_days() -> u32 {
    7
}
fn default_pong_retention_days() -> u32 {
    1
}
fn default_ack_retry_attempts() -> u32 {
    3
}
fn default_reconnect_initial_secs() -> u64 {
    5
}
fn default_reconnect_cap_secs() -> u64 {
    60
}
fn default_reconnect_min_gap_secs() -> u64 {
    3
}
fn default_probe_interval_secs() -> u64 {
    20
}
fn default_probe_fail_window_secs() -> u64 {
    60
}
fn default_probe_fail_limit() -> u32 {
    3
}
fn default_parked_window_secs() -> u64 {
    60
}

impl Default for NetworkConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty network config has defaults")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty timing config has defaults")
    }
}

impl Config {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations whose listener ports collide.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = &self.network;
        let ports = [n.ping_port, n.tap_port, n.pong_port, n.ack_port];
        for (i, port) in ports.iter().enumerate() {
            if ports[i + 1..].contains(port) {
                return Err(ConfigError::DuplicatePort(*port));
            }
        }
        Ok(())
    }

    pub fn retry_tick(&self) -> Duration {
        Duration::from_secs(self.timing.retry_tick_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.download_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.network.dial_timeout_secs)
    }

    /// Ping expiry / retention window in milliseconds.
    pub fn ping_retention_ms(&self) -> i64 {
        self.timing.ping_retention_days as i64 * 24 * 60 * 60 * 1000
    }

    pub fn pong_retention_ms(&self) -> i64 {
        self.timing.pong_retention_days as i64 * 24 * 60 * 60 * 1000
    }
}

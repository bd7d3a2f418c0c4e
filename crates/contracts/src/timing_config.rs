//! Clock sync, retry and liveness configuration shared across crates.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Clock synchronisation parameters
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClockSyncConfig {
    /// Samples retained per peer
    #[validate(range(min = 1))]
    pub window_size: usize,
    /// Samples with a longer round trip are discarded (ms)
    #[validate(range(min = 0.1))]
    pub max_round_trip_ms: f64,
    /// Samples older than this are evicted (s)
    #[validate(range(min = 0.1))]
    pub max_sample_age_secs: f64,
    /// Pings sent per sync burst
    #[validate(range(min = 1))]
    pub burst_size: u32,
    /// Heartbeat-driven resync period (s)
    #[validate(range(min = 0.1))]
    pub resync_interval_secs: f64,
    /// Samples needed before an estimate counts as synced
    #[validate(range(min = 1))]
    pub min_samples: usize,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            window_size: 8,
            max_round_trip_ms: 100.0,
            max_sample_age_secs: 60.0,
            burst_size: 5,
            resync_interval_secs: 10.0,
            min_samples: 3,
        }
    }
}

impl ClockSyncConfig {
    pub fn max_round_trip_nanos(&self) -> i64 {
        (self.max_round_trip_ms * 1e6) as i64
    }

    pub fn max_sample_age_nanos(&self) -> i64 {
        (self.max_sample_age_secs * 1e9) as i64
    }

    pub fn resync_interval_nanos(&self) -> i64 {
        (self.resync_interval_secs * 1e9) as i64
    }
}

/// Ack/retry policy
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    #[validate(range(min = 1))]
    pub base_delay_ms: u64,
    #[validate(range(min = 1.0))]
    pub multiplier: f64,
    #[validate(range(min = 1))]
    pub max_delay_ms: u64,
    /// Total sends including the first one
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    /// Remembered inbound keys for de-duplication
    #[validate(range(min = 16))]
    pub dedup_capacity: usize,
    /// Retry scheduler tick (ms)
    #[validate(range(min = 1))]
    pub tick_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 2_000,
            max_attempts: 6,
            dedup_capacity: 1_024,
            tick_ms: 20,
        }
    }
}

impl RetryConfig {
    /// Delay before resend number `attempt` (1-based count of sends so far).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Heartbeat / liveness
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HeartbeatConfig {
    #[validate(range(min = 10))]
    pub interval_ms: u64,
    #[validate(range(min = 10))]
    pub peer_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            peer_timeout_ms: 4_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval_nanos(&self) -> i64 {
        self.interval_ms as i64 * 1_000_000
    }

    pub fn peer_timeout_nanos(&self) -> i64 {
        self.peer_timeout_ms as i64 * 1_000_000
    }
}

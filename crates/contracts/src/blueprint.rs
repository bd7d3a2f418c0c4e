//! TimingBlueprint - output of the config loader
//!
//! One document describing a timing session: gates, detector, clock sync,
//! retry policy and result sinks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

use crate::{
    ClockSyncConfig, DetectorConfig, DeviceId, GateAssignment, GateRole, HeartbeatConfig,
    RetryConfig, StartType,
};

/// Blueprint schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlueprintVersion {
    #[default]
    V1,
}

/// Complete timing session blueprint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingBlueprint {
    #[serde(default)]
    pub version: BlueprintVersion,

    #[serde(default)]
    pub session: SessionSettings,

    /// Course gates, in any order
    #[serde(default)]
    pub gates: Vec<GateConfig>,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub clock_sync: ClockSyncConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Where completed runs go
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

/// Session-wide settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SessionSettings {
    #[validate(length(min = 1))]
    pub session_id: String,

    /// Device that hosts the session
    pub host_id: DeviceId,

    pub start_type: StartType,

    /// Countdown length (s)
    #[validate(range(max = 60))]
    pub countdown_seconds: u32,

    /// How long after the start the host waits for a result (s)
    #[validate(range(min = 1.0))]
    pub result_timeout_secs: f64,

    /// Uncertainty charged to a gate without a clock estimate (ms)
    #[validate(range(min = 0.0))]
    pub unsynced_uncertainty_ms: f64,

    /// Periodic gate status interval (ms)
    #[validate(range(min = 10))]
    pub status_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_id: "session".to_string(),
            host_id: DeviceId::from("host"),
            start_type: StartType::Flying,
            countdown_seconds: 3,
            result_timeout_secs: 30.0,
            unsynced_uncertainty_ms: 50.0,
            status_interval_ms: 2_000,
        }
    }
}

impl SessionSettings {
    pub fn result_timeout_nanos(&self) -> i64 {
        (self.result_timeout_secs * 1e9) as i64
    }

    pub fn status_interval_nanos(&self) -> i64 {
        self.status_interval_ms as i64 * 1_000_000
    }
}

/// One timing gate
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GateConfig {
    #[validate(length(min = 1))]
    pub id: String,

    pub role: GateRole,

    /// Position along the course
    pub index: u32,

    /// Distance from the start (m)
    #[validate(range(min = 0.0))]
    pub distance_m: f64,

    /// Pre-bound device; otherwise assigned on role request
    #[serde(default)]
    pub device_id: Option<DeviceId>,

    /// Overrides the detector gate line position
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub gate_position: Option<f64>,
}

impl GateConfig {
    pub fn to_assignment(&self) -> GateAssignment {
        GateAssignment {
            gate_id: self.id.clone(),
            role: self.role,
            gate_index: self.index,
            distance_meters: self.distance_m,
            device_id: self.device_id.clone(),
        }
    }
}

/// Result sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub name: String,

    pub sink_type: SinkType,

    /// Queue capacity (records)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Type-specific parameters
    #[serde(default)]
    pub params: HashMap<String, String>,
}

fn default_queue_capacity() -> usize {
    16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    /// Log through tracing
    Log,
    /// Append JSON Lines files
    File,
}

impl TimingBlueprint {
    /// Gate assignments ordered by course index.
    pub fn gate_assignments(&self) -> Vec<GateAssignment> {
        let mut gates: Vec<GateAssignment> =
            self.gates.iter().map(GateConfig::to_assignment).collect();
        gates.sort_by_key(|g| g.gate_index);
        gates
    }

    /// Detector config for one gate, honouring its gate-line override.
    pub fn detector_for_gate(&self, gate_id: &str) -> DetectorConfig {
        let mut cfg = self.detector.clone();
        if let Some(position) = self
            .gates
            .iter()
            .find(|g| g.id == gate_id)
            .and_then(|g| g.gate_position)
        {
            cfg.gate_position = position;
        }
        cfg
    }

    pub fn total_distance_m(&self) -> f64 {
        self.gates
            .iter()
            .map(|g| g.distance_m)
            .fold(0.0, f64::max)
    }
}

//! Split and run result records.

use serde::{Deserialize, Serialize};

use crate::StartType;

/// Elapsed time between two consecutive timing gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSplit {
    pub from_gate_id: String,
    pub to_gate_id: String,
    pub from_index: u32,
    pub to_index: u32,
    /// Segment length (m)
    pub distance_meters: f64,
    /// Segment time (ns)
    pub split_nanos: i64,
    /// Time since start at `to_gate_id` (ns)
    pub cumulative_nanos: i64,
    /// Distance since start at `to_gate_id` (m)
    pub cumulative_distance_meters: f64,
    /// Average segment speed (m/s), zero when the split is not positive
    pub speed_mps: f64,
    pub uncertainty_ms: f64,
}

/// Completed run handed to result sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub session_id: String,
    pub run_id: String,
    /// Wall-clock completion time (unix ms), for storage only
    pub completed_at_unix_ms: i64,
    pub start_type: StartType,
    pub total_split_nanos: i64,
    pub total_distance_meters: f64,
    pub segments: Vec<SegmentSplit>,
    pub uncertainty_ms: f64,
    /// False when at least one gate had no usable clock estimate
    pub synced: bool,
}

impl RunRecord {
    pub fn total_seconds(&self) -> f64 {
        self.total_split_nanos as f64 / 1e9
    }
}

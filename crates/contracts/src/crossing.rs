//! Local crossing events emitted by the detector.

use serde::{Deserialize, Serialize};

/// A confirmed gate-line crossing on one device.
///
/// Timestamps are in the detecting device's monotonic clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossingEvent {
    /// Sub-frame interpolated crossing time (ns)
    pub timestamp_nanos: i64,
    /// Capture time of the triggering frame (ns)
    pub raw_timestamp_nanos: i64,
    pub frame_index: u64,
    /// 0.0 ..= 1.0
    pub confidence: f32,
    /// Horizontal centroid velocity at trigger (px/s, signed)
    pub velocity_px_per_sec: f32,
    /// Base64 JPEG crop around the gate line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

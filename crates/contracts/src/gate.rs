//! Gate roles, assignments and detector status.

use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// Timing role of a gate along the course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GateRole {
    Start,
    Finish,
    Lap,
    /// Non-timing observer (e.g. host tablet without a camera)
    Control,
}

impl GateRole {
    /// Whether crossings at this gate contribute to splits.
    pub fn is_timing(&self) -> bool {
        !matches!(self, GateRole::Control)
    }
}

impl std::fmt::Display for GateRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GateRole::Start => "start",
            GateRole::Finish => "finish",
            GateRole::Lap => "lap",
            GateRole::Control => "control",
        };
        f.write_str(s)
    }
}

/// How the clock starts for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StartType {
    /// Start-gate crossing starts the clock
    #[default]
    Flying,
    /// Host countdown reaching zero starts the clock
    Countdown,
    /// Host operator starts the clock immediately
    Manual,
}

/// A gate's place on the course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateAssignment {
    pub gate_id: String,
    pub role: GateRole,
    /// Ordering along the course, start lowest
    pub gate_index: u32,
    /// Distance from the start line in meters
    pub distance_meters: f64,
    /// Device currently bound to this gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

/// Distance entry for mid-session distance changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDistance {
    pub gate_id: String,
    pub distance_meters: f64,
}

/// Detector lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectorPhase {
    #[default]
    Unstable,
    NoAthlete,
    AthleteTooFar,
    Ready,
    Triggered,
    Cooldown,
}

impl DetectorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorPhase::Unstable => "UNSTABLE",
            DetectorPhase::NoAthlete => "NO_ATHLETE",
            DetectorPhase::AthleteTooFar => "ATHLETE_TOO_FAR",
            DetectorPhase::Ready => "READY",
            DetectorPhase::Triggered => "TRIGGERED",
            DetectorPhase::Cooldown => "COOLDOWN",
        }
    }
}

/// Continuous gate health reported by the detector.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStatusInfo {
    pub is_calibrated: bool,
    pub is_armed: bool,
    /// No blob currently inside the strips
    pub is_clear: bool,
    pub is_prebuffer_ready: bool,
    pub is_stable: bool,
    pub gate_position: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f32>,
}

impl GateStatusInfo {
    /// A gate may be armed once it is calibrated, clear, prebuffered and stable.
    pub fn can_arm(&self) -> bool {
        self.is_calibrated && self.is_clear && self.is_prebuffer_ready && self.is_stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_status() -> GateStatusInfo {
        GateStatusInfo {
            is_calibrated: true,
            is_armed: false,
            is_clear: true,
            is_prebuffer_ready: true,
            is_stable: true,
            gate_position: 0.5,
            battery_level: Some(0.8),
        }
    }

    #[test]
    fn test_can_arm_requires_every_flag() {
        assert!(ready_status().can_arm());

        let mut s = ready_status();
        s.is_clear = false;
        assert!(!s.can_arm());

        let mut s = ready_status();
        s.is_stable = false;
        assert!(!s.can_arm());

        let mut s = ready_status();
        s.is_prebuffer_ready = false;
        assert!(!s.can_arm());
    }

    #[test]
    fn test_gate_status_wire_names() {
        let json = serde_json::to_value(ready_status()).unwrap();
        assert_eq!(json["isCalibrated"], true);
        assert_eq!(json["gatePosition"], 0.5);
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&GateRole::Lap).unwrap(), "\"lap\"");
        let role: GateRole = serde_json::from_str("\"finish\"").unwrap();
        assert_eq!(role, GateRole::Finish);
    }
}

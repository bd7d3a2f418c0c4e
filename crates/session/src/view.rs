//! Shared session view rebuilt from host broadcasts

use std::collections::{BTreeMap, BTreeSet};

use contracts::{SegmentSplit, StartType};
use protocol::{ConfigType, Payload, TimingMessage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ConfigVersions, SessionPhase};

/// Latest broadcast result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultView {
    pub run_id: String,
    pub total_split_nanos: i64,
    pub uncertainty_ms: f64,
    pub segments: Vec<SegmentSplit>,
}

/// Everything a participant knows about the session from replayable broadcasts.
///
/// Always equal to applying the received broadcasts in sender sequence order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub phase: SessionPhase,
    pub run_id: Option<String>,
    pub start_type: StartType,
    pub gate_distances: BTreeMap<String, f64>,
    pub gate_positions: BTreeMap<String, f64>,
    pub versions: ConfigVersions,
    pub armed: bool,
    pub paused: bool,
    /// Count of applied `calibrateAll` broadcasts
    pub calibration_epoch: u64,
    /// Start signal on the host clock for countdown and manual starts
    pub start_nanos_host: Option<i64>,
    pub last_result: Option<ResultView>,
    pub completed_runs: BTreeSet<String>,
    pub last_event_id: Option<String>,
    pub last_seq: u64,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Calibrating,
            run_id: None,
            start_type: StartType::default(),
            gate_distances: BTreeMap::new(),
            gate_positions: BTreeMap::new(),
            versions: ConfigVersions::new(),
            armed: false,
            paused: false,
            calibration_epoch: 0,
            start_nanos_host: None,
            last_result: None,
            completed_runs: BTreeSet::new(),
            last_event_id: None,
            last_seq: 0,
        }
    }
}

impl SessionView {
    /// Apply one replayable broadcast.
    pub fn apply(&mut self, message: &TimingMessage) {
        if self.phase.is_terminal() {
            self.last_seq = self.last_seq.max(message.seq);
            return;
        }
        match &message.payload {
            Payload::NewRun { run_id } => {
                self.run_id = Some(run_id.clone());
                self.start_nanos_host = None;
                self.armed = false;
                self.set_phase(SessionPhase::Idle);
            }
            Payload::CalibrateAll {} => {
                self.calibration_epoch += 1;
                self.armed = false;
                self.set_phase(SessionPhase::Calibrating);
            }
            Payload::ArmAll {} => {
                self.armed = true;
                self.set_phase(SessionPhase::Armed);
            }
            Payload::DisarmAll {} => {
                self.armed = false;
                if !self.phase.is_running() {
                    self.set_phase(SessionPhase::Idle);
                }
            }
            Payload::StartRun { run_id, .. } => {
                self.run_id = Some(run_id.clone());
                self.start_nanos_host = None;
                self.set_phase(SessionPhase::RunInProgress);
            }
            Payload::StartEvent {
                monotonic_nanos,
                run_id,
                ..
            } => {
                if self.run_id.as_deref() == Some(run_id) {
                    self.start_nanos_host = Some(*monotonic_nanos);
                }
            }
            Payload::StartTiming {} => {}
            Payload::TimingResultBroadcast {
                split_nanos,
                uncertainty_ms,
                run_id,
                ..
            } => {
                if self.last_result.as_ref().map(|r| &r.run_id) != Some(run_id) {
                    self.last_result = Some(ResultView {
                        run_id: run_id.clone(),
                        total_split_nanos: *split_nanos,
                        uncertainty_ms: *uncertainty_ms,
                        segments: Vec::new(),
                    });
                }
                self.finish_run(run_id);
            }
            Payload::MultiGateResult {
                total_split_nanos,
                segments,
                uncertainty_ms,
                run_id,
            } => {
                self.last_result = Some(ResultView {
                    run_id: run_id.clone(),
                    total_split_nanos: *total_split_nanos,
                    uncertainty_ms: *uncertainty_ms,
                    segments: segments.clone(),
                });
                self.finish_run(run_id);
            }
            Payload::CancelRun { run_id } => {
                if self.run_id.as_deref() == Some(run_id) {
                    self.armed = false;
                    self.start_nanos_host = None;
                    self.set_phase(SessionPhase::Idle);
                }
            }
            Payload::Abort { .. } => {
                self.armed = false;
                self.set_phase(SessionPhase::Aborted);
            }
            Payload::SessionEnded { .. } => {
                self.armed = false;
                self.set_phase(SessionPhase::SessionEnded);
            }
            Payload::PauseDetection {} => self.paused = true,
            Payload::ResumeDetection {} => self.paused = false,
            Payload::AdjustGateLine { gate_id, position } => {
                self.gate_positions.insert(gate_id.clone(), *position);
            }
            Payload::StartTypeChanged {
                start_type,
                version,
            } => {
                if self.versions.accept(ConfigType::StartType, *version) {
                    self.start_type = *start_type;
                } else {
                    debug!(version, "stale start type change ignored");
                }
            }
            Payload::DistanceConfigChanged {
                gate_distances,
                version,
            } => {
                if self.versions.accept(ConfigType::Distances, *version) {
                    for d in gate_distances {
                        self.gate_distances
                            .insert(d.gate_id.clone(), d.distance_meters);
                    }
                } else {
                    debug!(version, "stale distance change ignored");
                }
            }
            other => {
                debug!(case = other.case_name(), "not a view broadcast");
                return;
            }
        }
        self.last_seq = message.seq;
        if message.event_id.is_some() {
            self.last_event_id = message.event_id.clone();
        }
    }

    fn finish_run(&mut self, run_id: &str) {
        self.completed_runs.insert(run_id.to_string());
        if self.run_id.as_deref() == Some(run_id) {
            self.armed = false;
            self.set_phase(SessionPhase::Idle);
        }
    }

    fn set_phase(&mut self, next: SessionPhase) {
        if self.phase.is_terminal() {
            return;
        }
        if !self.phase.can_transition_to(next) && self.phase != next {
            debug!(from = ?self.phase, to = ?next, "host-driven phase jump");
        }
        self.phase = next;
    }
}

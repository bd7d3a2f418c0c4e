//! HostCoordinator - authoritative session state on the host device
//!
//! Sans-IO: every entry point takes the host's monotonic time and returns the
//! [`Output`]s the driver must carry out. The host owns [`SessionState`]
//! exclusively; participants only see what it broadcasts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use clock_sync::{ClockEstimate, ClockSyncEngine, PingRequest};
use contracts::{
    DeviceId, GateAssignment, GateDistance, GateRole, GateStatusInfo, HeartbeatConfig, RunRecord,
    SessionSettings, StartType, TimingBlueprint,
};
use protocol::{ConfigType, DebugLevel, EnvelopeBuilder, Payload, TimingMessage};
use tracing::{debug, error, info, instrument, warn};
use transport::{DeliveryFailure, TransportEvent};

use crate::event_log::{is_replayable, EventLog};
use crate::splits::{compute_splits, ProjectedCrossing, SplitOutcome};
use crate::{ConfigVersions, CoordinatorError, Output, SessionPhase};

const EVENT_LOG_CAPACITY: usize = 512;
const THUMBNAIL_CAPACITY: usize = 64;
const ONE_SECOND_NANOS: i64 = 1_000_000_000;

/// Host-side record of one participant device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub device_name: String,
    pub gate_id: Option<String>,
    pub role: Option<GateRole>,
    pub connected: bool,
    /// Role and gate acked, `roleConfirmed` sent
    pub confirmed: bool,
    pub role_acked: bool,
    pub gate_acked: bool,
    pub calibrated: Option<bool>,
    pub armed_acked: bool,
    pub status: GateStatusInfo,
    pub last_heard_nanos: i64,
    pub clock: Option<ClockEstimate>,
    /// Host time from which broadcasts may have been missed while disconnected
    pub missed_since_nanos: Option<i64>,
}

impl DeviceRecord {
    fn new(device_id: DeviceId, device_name: String, now: i64) -> Self {
        Self {
            device_id,
            device_name,
            gate_id: None,
            role: None,
            connected: true,
            confirmed: false,
            role_acked: false,
            gate_acked: false,
            calibrated: None,
            armed_acked: false,
            status: GateStatusInfo::default(),
            last_heard_nanos: now,
            clock: None,
            missed_since_nanos: None,
        }
    }

    /// Connected, confirmed, armed and reporting a gate that can arm.
    pub fn ready_for_run(&self) -> bool {
        self.connected && self.confirmed && self.armed_acked && self.status.can_arm()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Countdown {
    remaining: u32,
    next_at: i64,
}

/// Run currently being timed.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRun {
    pub run_id: String,
    pub started_at: i64,
    pub deadline: i64,
    /// Host-clock start signal for countdown and manual starts
    pub start_signal: Option<i64>,
    pub crossings: HashMap<String, ProjectedCrossing>,
    /// Finish-gate self-reported splits
    pub provisional: Vec<(DeviceId, i64)>,
    countdown: Option<Countdown>,
}

/// Session state owned by the host coordination task.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub phase: SessionPhase,
    pub start_type: StartType,
    pub countdown_seconds: u32,
    /// Ordered by gate index
    pub gates: Vec<GateAssignment>,
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
    pub run: Option<ActiveRun>,
    pub prepared_run: Option<String>,
    pub last_record: Option<RunRecord>,
    pub versions: ConfigVersions,
    pub runs_started: u32,
}

/// Immutable copy of the host state for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSnapshot {
    pub session_id: String,
    pub phase: SessionPhase,
    pub start_type: StartType,
    pub gates: Vec<GateAssignment>,
    pub devices: Vec<DeviceRecord>,
    pub run_id: Option<String>,
    pub crossings: Vec<ProjectedCrossing>,
    pub last_record: Option<RunRecord>,
    pub start_type_version: u64,
    pub distance_version: u64,
    pub event_log_len: usize,
}

/// Operator commands for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    CalibrateAll,
    CalibrateGate(String),
    ArmAll,
    DisarmAll,
    NewRun,
    StartRun,
    StartTiming,
    CancelRun,
    Abort(String),
    EndSession(String),
    ChangeStartType(StartType),
    ChangeDistances(Vec<GateDistance>),
    AdjustGateLine { gate_id: String, position: f64 },
    PauseDetection,
    ResumeDetection,
    RequestSync,
}

pub struct HostCoordinator {
    state: SessionState,
    settings: SessionSettings,
    heartbeat: HeartbeatConfig,
    builder: Arc<EnvelopeBuilder>,
    sync: ClockSyncEngine,
    log: EventLog,
    thumbnails: BTreeMap<String, String>,
}

impl HostCoordinator {
    pub fn new(blueprint: &TimingBlueprint, builder: Arc<EnvelopeBuilder>) -> Self {
        let settings = blueprint.session.clone();
        let state = SessionState {
            session_id: settings.session_id.clone(),
            phase: SessionPhase::Connecting,
            start_type: settings.start_type,
            countdown_seconds: settings.countdown_seconds,
            gates: blueprint.gate_assignments(),
            devices: BTreeMap::new(),
            run: None,
            prepared_run: None,
            last_record: None,
            versions: ConfigVersions::new(),
            runs_started: 0,
        };
        let sync = ClockSyncEngine::new(builder.sender_id().clone(), blueprint.clock_sync.clone());
        Self {
            state,
            settings,
            heartbeat: blueprint.heartbeat.clone(),
            builder,
            sync,
            log: EventLog::new(EVENT_LOG_CAPACITY),
            thumbnails: BTreeMap::new(),
        }
    }

    pub fn host_id(&self) -> &DeviceId {
        self.builder.sender_id()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub fn snapshot(&self) -> HostSnapshot {
        let mut crossings: Vec<ProjectedCrossing> = self
            .state
            .run
            .as_ref()
            .map(|r| r.crossings.values().cloned().collect())
            .unwrap_or_default();
        crossings.sort_by_key(|c| c.host_nanos);
        HostSnapshot {
            session_id: self.state.session_id.clone(),
            phase: self.state.phase,
            start_type: self.state.start_type,
            gates: self.state.gates.clone(),
            devices: self.state.devices.values().cloned().collect(),
            run_id: self.state.run.as_ref().map(|r| r.run_id.clone()),
            crossings,
            last_record: self.state.last_record.clone(),
            start_type_version: self.state.versions.current(ConfigType::StartType),
            distance_version: self.state.versions.current(ConfigType::Distances),
            event_log_len: self.log.len(),
        }
    }

    /// Clock estimate used to project `device`'s timestamps.
    pub fn clock_estimate(&self, device: &DeviceId) -> Option<ClockEstimate> {
        self.sync.estimate(device)
    }

    pub fn thumbnail(&self, event_id: &str) -> Option<&str> {
        self.thumbnails.get(event_id).map(String::as_str)
    }

    pub fn handle_transport(&mut self, event: TransportEvent, now: i64) -> Vec<Output> {
        match event {
            TransportEvent::Message { from, message } => self.on_message(&from, message, now),
            TransportEvent::DeliveryFailed(failure) => self.on_delivery_failed(&failure, now),
            TransportEvent::Rejected { from, error } => {
                // Version mismatches and garbage end here; the sender gets a reason.
                let nack = self.builder.build(
                    Payload::Nack {
                        message_id: None,
                        reason: error,
                    },
                    now,
                );
                vec![Output::send_to(&from, nack)]
            }
        }
    }

    pub fn handle_command(
        &mut self,
        command: HostCommand,
        now: i64,
    ) -> Result<Vec<Output>, CoordinatorError> {
        match command {
            HostCommand::CalibrateAll => self.calibrate_all(now),
            HostCommand::CalibrateGate(gate_id) => self.calibrate_gate(&gate_id, now),
            HostCommand::ArmAll => self.arm_all(now),
            HostCommand::DisarmAll => self.disarm_all(now),
            HostCommand::NewRun => self.new_run(now).map(|(_, out)| out),
            HostCommand::StartRun => self.start_run(now),
            HostCommand::StartTiming => self.start_timing(now),
            HostCommand::CancelRun => self.cancel_run(now),
            HostCommand::Abort(reason) => Ok(self.abort(&reason, now)),
            HostCommand::EndSession(reason) => Ok(self.end_session(&reason, now)),
            HostCommand::ChangeStartType(start_type) => self.change_start_type(start_type, now),
            HostCommand::ChangeDistances(distances) => self.change_distances(distances, now),
            HostCommand::AdjustGateLine { gate_id, position } => {
                self.adjust_gate_line(&gate_id, position, now)
            }
            HostCommand::PauseDetection => self.broadcast_control(Payload::PauseDetection {}, now),
            HostCommand::ResumeDetection => {
                self.broadcast_control(Payload::ResumeDetection {}, now)
            }
            HostCommand::RequestSync => Ok(vec![self.broadcast(Payload::SyncRequest {}, now)]),
        }
    }

    // ---------------------------------------------------------------------
    // inbound
    // ---------------------------------------------------------------------

    #[instrument(
        name = "host_on_message",
        skip(self, message, now),
        fields(from = %from, case = message.case_name(), seq = message.seq)
    )]
    pub fn on_message(&mut self, from: &DeviceId, message: TimingMessage, now: i64) -> Vec<Output> {
        if message.session_id != self.state.session_id {
            warn!(session = %message.session_id, "message for another session dropped");
            let nack = self.builder.build(
                Payload::Nack {
                    message_id: message.message_id.clone(),
                    reason: format!("unknown session '{}'", message.session_id),
                },
                now,
            );
            return vec![Output::send_to(from, nack)];
        }

        let mut out = self.touch(from, now);
        let event_id = message.event_id.clone();
        let seq = message.seq;

        match message.payload {
            Payload::RoleRequest {
                device_name,
                requested_role,
            } => out.extend(self.on_role_request(from, device_name, requested_role, now)),
            Payload::SessionConfigAck { accepted } => {
                if !accepted {
                    warn!(device = %from, "device refused session config");
                }
            }
            Payload::RoleAssignedAck { role } => {
                if let Some(device) = self.state.devices.get_mut(from) {
                    device.role_acked = device.role == Some(role);
                }
                out.extend(self.maybe_confirm(from, now));
            }
            Payload::GateAssignedAck { gate_id } => {
                if let Some(device) = self.state.devices.get_mut(from) {
                    device.gate_acked = device.gate_id.as_deref() == Some(gate_id.as_str());
                }
                out.extend(self.maybe_confirm(from, now));
            }
            Payload::HeartbeatPing {} => {
                let pong = self
                    .builder
                    .build(Payload::HeartbeatPong { ping_seq: seq }, now);
                out.push(Output::send_to(from, pong));
            }
            Payload::SyncPing {
                ping_id,
                t1_nanos,
                requester_id,
            } => {
                let pong = ClockSyncEngine::respond(
                    &PingRequest {
                        ping_id,
                        t1_nanos,
                        requester_id,
                    },
                    now,
                    now,
                );
                let reply = self.builder.build(
                    Payload::SyncPong {
                        ping_id: pong.ping_id,
                        t1_nanos: pong.t1_nanos,
                        t2_nanos: pong.t2_nanos,
                        t3_nanos: pong.t3_nanos,
                        requester_id: pong.requester_id,
                    },
                    now,
                );
                out.push(Output::send_to(from, reply));
            }
            Payload::SyncComplete {
                offset_nanos,
                uncertainty_ms,
            } => self.on_sync_complete(from, offset_nanos, uncertainty_ms, now),
            Payload::CalibrationStatus {
                gate_id,
                success,
                error,
            } => {
                if let Some(device) = self.state.devices.get_mut(from) {
                    device.calibrated = Some(success);
                }
                if success {
                    info!(gate_id = %gate_id, "gate calibrated");
                } else {
                    warn!(gate_id = %gate_id, error = ?error, "gate calibration failed");
                }
            }
            Payload::ArmedAck { gate_id, .. } => out.extend(self.on_armed_ack(from, &gate_id, now)),
            Payload::GateStatus { gate_id, status, .. } => {
                if let Some(device) = self.state.devices.get_mut(from) {
                    if device.gate_id.as_deref() == Some(gate_id.as_str()) {
                        device.status = status;
                    }
                }
            }
            Payload::CrossingEvent {
                gate_id,
                role,
                timestamp_nanos,
                confidence,
                thumbnail_data,
                run_id,
                ..
            } => out.extend(self.on_crossing(
                from,
                CrossingReport {
                    gate_id,
                    role,
                    timestamp_nanos,
                    confidence,
                    thumbnail_data,
                    run_id,
                    event_id,
                },
                now,
            )),
            Payload::FinishResult {
                split_nanos,
                uncertainty_ms,
                run_id,
                ..
            } => self.on_provisional(from, &run_id, split_nanos, uncertainty_ms),
            Payload::EventSync {
                last_seen_event_id,
                run_id,
            } => {
                let events = self.log.replay(last_seen_event_id.as_deref(), &run_id);
                debug!(events = events.len(), "event sync replay");
                let reply = self.builder.build(
                    Payload::EventSyncResponse {
                        events,
                        from_event_id: last_seen_event_id,
                    },
                    now,
                );
                out.push(Output::send_to(from, reply));
            }
            Payload::ThumbnailRequest { event_id } => {
                let payload = match self.thumbnails.get(&event_id) {
                    Some(data) => Payload::ThumbnailData {
                        event_id,
                        data: data.clone(),
                    },
                    None => Payload::Nack {
                        message_id: None,
                        reason: format!("no thumbnail for '{event_id}'"),
                    },
                };
                out.push(Output::send_to(from, self.builder.build(payload, now)));
            }
            Payload::DebugLog { level, message } => match level {
                DebugLevel::Debug => debug!(device = %from, "{message}"),
                DebugLevel::Info => info!(device = %from, "{message}"),
                DebugLevel::Warn => warn!(device = %from, "{message}"),
                DebugLevel::Error => error!(device = %from, "{message}"),
            },
            Payload::Nack { message_id, reason } => {
                warn!(message_id = ?message_id, reason = %reason, "nack from device");
            }
            other => debug!(case = other.case_name(), "ignored on host"),
        }
        out
    }

    /// A critical message to `failure.peer` ran out of retries.
    pub fn on_delivery_failed(&mut self, failure: &DeliveryFailure, now: i64) -> Vec<Output> {
        warn!(
            peer = %failure.peer,
            case = failure.case,
            run_id = ?failure.run_id,
            "device missed a critical message"
        );
        self.mark_disconnected(&failure.peer, now)
    }

    fn touch(&mut self, from: &DeviceId, now: i64) -> Vec<Output> {
        let Some(device) = self.state.devices.get_mut(from) else {
            return Vec::new();
        };
        device.last_heard_nanos = now;
        if device.connected {
            return Vec::new();
        }
        device.connected = true;
        let missed_since = device.missed_since_nanos.take();
        let confirmed = device.confirmed;
        info!(device = %from, "device reconnected");
        if !confirmed {
            return Vec::new();
        }
        let mut out: Vec<Output> = self.gate_status_broadcast(from, now).into_iter().collect();
        if let Some(since) = missed_since {
            let events = self.log.replay_since(since);
            if !events.is_empty() {
                debug!(device = %from, events = events.len(), "replaying broadcasts to reconnected device");
                let resync = self.builder.build(
                    Payload::EventSyncResponse {
                        events,
                        from_event_id: None,
                    },
                    now,
                );
                out.push(Output::send_to(from, resync));
            }
        }
        out
    }

    fn mark_disconnected(&mut self, device_id: &DeviceId, now: i64) -> Vec<Output> {
        let Some(device) = self.state.devices.get_mut(device_id) else {
            return Vec::new();
        };
        if !device.connected {
            return Vec::new();
        }
        device.connected = false;
        device.armed_acked = false;
        // anything sent after we last heard from it may not have arrived
        device.missed_since_nanos = Some(device.last_heard_nanos);
        warn!(device = %device_id, gate_id = ?device.gate_id, "device marked disconnected");
        let confirmed = device.confirmed;
        if confirmed {
            self.gate_status_broadcast(device_id, now).into_iter().collect()
        } else {
            Vec::new()
        }
    }

    fn gate_status_broadcast(&mut self, device_id: &DeviceId, now: i64) -> Option<Output> {
        let device = self.state.devices.get(device_id)?;
        let gate_id = device.gate_id.clone()?;
        let payload = Payload::GateStatus {
            gate_id,
            status: device.status.clone(),
            connected: device.connected,
        };
        let to: Vec<DeviceId> = self
            .recipients()
            .into_iter()
            .filter(|d| d != device_id)
            .collect();
        Some(Output::Send {
            to,
            message: self.builder.build(payload, now),
        })
    }

    // ---------------------------------------------------------------------
    // role negotiation
    // ---------------------------------------------------------------------

    fn on_role_request(
        &mut self,
        from: &DeviceId,
        device_name: String,
        requested_role: Option<GateRole>,
        now: i64,
    ) -> Vec<Output> {
        let Some(index) = self.pick_gate(from, requested_role) else {
            warn!(device = %from, ?requested_role, "no free gate for device");
            let nack = self.builder.build(
                Payload::Nack {
                    message_id: None,
                    reason: "no free gate".into(),
                },
                now,
            );
            return vec![Output::send_to(from, nack)];
        };

        let gate = {
            let gate = &mut self.state.gates[index];
            gate.device_id = Some(from.clone());
            gate.clone()
        };
        let device = self
            .state
            .devices
            .entry(from.clone())
            .or_insert_with(|| DeviceRecord::new(from.clone(), device_name.clone(), now));
        device.device_name = device_name;
        device.gate_id = Some(gate.gate_id.clone());
        device.role = Some(gate.role);
        device.connected = true;

        if self.state.phase == SessionPhase::Connecting {
            self.transition(SessionPhase::RoleNegotiation);
        }

        info!(device = %from, gate_id = %gate.gate_id, role = %gate.role, "gate assigned");
        let messages = [
            Payload::SessionConfig {
                host_id: self.host_id().clone(),
                start_type: self.state.start_type,
                countdown_seconds: self.state.countdown_seconds,
                gates: self.state.gates.clone(),
            },
            Payload::RoleAssigned {
                device_id: from.clone(),
                role: gate.role,
            },
            Payload::GateAssigned {
                device_id: from.clone(),
                gate_id: gate.gate_id.clone(),
                gate_index: gate.gate_index,
                distance_meters: gate.distance_meters,
            },
        ];
        let mut out: Vec<Output> = messages
            .into_iter()
            .map(|p| Output::send_to(from, self.builder.build(p, now)))
            .collect();

        // Re-requests from an already confirmed device only need the confirmation again.
        if self.state.devices.get(from).is_some_and(|d| d.confirmed) {
            out.push(Output::send_to(
                from,
                self.builder.build(Payload::RoleConfirmed {}, now),
            ));
        }
        out
    }

    fn pick_gate(&self, from: &DeviceId, requested_role: Option<GateRole>) -> Option<usize> {
        let gates = &self.state.gates;
        if let Some(i) = gates.iter().position(|g| g.device_id.as_ref() == Some(from)) {
            return Some(i);
        }
        let free = |g: &GateAssignment| g.device_id.is_none();
        if let Some(role) = requested_role {
            if let Some(i) = gates.iter().position(|g| free(g) && g.role == role) {
                return Some(i);
            }
        }
        gates
            .iter()
            .position(|g| free(g) && g.role.is_timing())
            .or_else(|| gates.iter().position(free))
    }

    fn maybe_confirm(&mut self, from: &DeviceId, now: i64) -> Vec<Output> {
        let Some(device) = self.state.devices.get_mut(from) else {
            return Vec::new();
        };
        if device.confirmed || !(device.role_acked && device.gate_acked) {
            return Vec::new();
        }
        device.confirmed = true;
        info!(device = %from, gate_id = ?device.gate_id, "role confirmed");

        let mut out = vec![Output::send_to(
            from,
            self.builder.build(Payload::RoleConfirmed {}, now),
        )];
        for config_type in [ConfigType::StartType, ConfigType::Distances] {
            let version = self.state.versions.current(config_type);
            out.push(Output::send_to(
                from,
                self.builder.build(
                    Payload::ConfigVersion {
                        version,
                        config_type,
                    },
                    now,
                ),
            ));
        }
        out.push(Output::send_to(
            from,
            self.builder.build(Payload::SyncRequest {}, now),
        ));

        if matches!(
            self.state.phase,
            SessionPhase::Connecting | SessionPhase::RoleNegotiation
        ) && self.all_timing_gates(|d| d.confirmed)
        {
            info!(gates = self.state.gates.len(), "all gates assigned");
            self.transition(SessionPhase::Calibrating);
        }
        out
    }

    fn on_sync_complete(&mut self, from: &DeviceId, offset_nanos: i64, uncertainty_ms: f64, now: i64) {
        self.sync
            .record_reported(from, offset_nanos, uncertainty_ms, now);
        let estimate = self.sync.estimate(from);
        if let Some(device) = self.state.devices.get_mut(from) {
            device.clock = estimate;
        }
        if let Some(e) = estimate {
            debug!(
                device = %from,
                offset_ms = e.offset_nanos as f64 / 1e6,
                uncertainty_ms = e.uncertainty_ms,
                "device clock synced"
            );
            metrics::gauge!("timing_clock_offset_ms", "peer" => from.to_string())
                .set(e.offset_nanos as f64 / 1e6);
            metrics::gauge!("timing_clock_uncertainty_ms", "peer" => from.to_string())
                .set(e.uncertainty_ms);
        }
    }

    fn on_armed_ack(&mut self, from: &DeviceId, gate_id: &str, now: i64) -> Vec<Output> {
        if let Some(device) = self.state.devices.get_mut(from) {
            if device.gate_id.as_deref() == Some(gate_id) {
                device.armed_acked = true;
            }
        }
        if self.state.phase == SessionPhase::Armed && self.all_timing_gates(|d| d.armed_acked) {
            info!("all gates armed");
            return vec![self.broadcast(Payload::Armed {}, now)];
        }
        Vec::new()
    }

    // ---------------------------------------------------------------------
    // operator commands
    // ---------------------------------------------------------------------

    pub fn calibrate_all(&mut self, now: i64) -> Result<Vec<Output>, CoordinatorError> {
        self.require_phase(
            "calibrate",
            &[
                SessionPhase::Calibrating,
                SessionPhase::Idle,
                SessionPhase::Armed,
                SessionPhase::Aborted,
            ],
        )?;
        for device in self.state.devices.values_mut() {
            device.calibrated = None;
            device.armed_acked = false;
        }
        self.transition(SessionPhase::Calibrating);
        Ok(vec![self.broadcast(Payload::CalibrateAll {}, now)])
    }

    pub fn calibrate_gate(&mut self, gate_id: &str, now: i64) -> Result<Vec<Output>, CoordinatorError> {
        let device = self.device_for_gate(gate_id)?;
        Ok(vec![Output::send_to(
            &device,
            self.builder.build(Payload::CalibrateRequest {}, now),
        )])
    }

    pub fn arm_all(&mut self, now: i64) -> Result<Vec<Output>, CoordinatorError> {
        self.require_phase(
            "arm",
            &[
                SessionPhase::Calibrating,
                SessionPhase::Idle,
                SessionPhase::Armed,
            ],
        )?;
        for device in self.state.devices.values_mut() {
            device.armed_acked = false;
        }
        self.transition(SessionPhase::Armed);
        // Fresh offsets before a timed run
        let sync = self.broadcast(Payload::SyncRequest {}, now);
        let arm = self.broadcast(Payload::ArmAll {}, now);
        Ok(vec![sync, arm])
    }

    pub fn disarm_all(&mut self, now: i64) -> Result<Vec<Output>, CoordinatorError> {
        if self.state.phase.is_running() {
            return Err(CoordinatorError::invalid_phase("disarm", self.state.phase));
        }
        for device in self.state.devices.values_mut() {
            device.armed_acked = false;
        }
        if self.state.phase == SessionPhase::Armed {
            self.transition(SessionPhase::Idle);
        }
        Ok(vec![self.broadcast(Payload::DisarmAll {}, now)])
    }

    /// Announce the id of the next run.
    pub fn new_run(&mut self, now: i64) -> Result<(String, Vec<Output>), CoordinatorError> {
        self.require_phase(
            "prepare a run",
            &[
                SessionPhase::Calibrating,
                SessionPhase::Armed,
                SessionPhase::Idle,
                SessionPhase::Aborted,
            ],
        )?;
        let run_id = self.next_run_id();
        self.state.prepared_run = Some(run_id.clone());
        for device in self.state.devices.values_mut() {
            device.armed_acked = false;
        }
        self.transition(SessionPhase::Idle);
        info!(run_id = %run_id, "new run");
        let out = self.broadcast(
            Payload::NewRun {
                run_id: run_id.clone(),
            },
            now,
        );
        Ok((run_id, vec![out]))
    }

    #[instrument(name = "host_start_run", skip(self))]
    pub fn start_run(&mut self, now: i64) -> Result<Vec<Output>, CoordinatorError> {
        self.require_phase("start a run", &[SessionPhase::Armed])?;
        let unready = self.unready_gates();
        if !unready.is_empty() {
            return Err(CoordinatorError::GatesNotReady { gates: unready });
        }

        let run_id = match self.state.prepared_run.take() {
            Some(id) => id,
            None => self.next_run_id(),
        };
        let countdown_seconds = match self.state.start_type {
            StartType::Countdown => self.state.countdown_seconds,
            StartType::Flying | StartType::Manual => 0,
        };
        let deadline = now
            + i64::from(countdown_seconds) * ONE_SECOND_NANOS
            + self.settings.result_timeout_nanos();

        self.state.run = Some(ActiveRun {
            run_id: run_id.clone(),
            started_at: now,
            deadline,
            start_signal: None,
            crossings: HashMap::new(),
            provisional: Vec::new(),
            countdown: (self.state.start_type == StartType::Countdown).then_some(Countdown {
                remaining: countdown_seconds,
                next_at: now,
            }),
        });
        self.state.runs_started += 1;
        self.transition(SessionPhase::RunInProgress);
        info!(run_id = %run_id, start_type = ?self.state.start_type, "run started");

        let mut out = vec![self.broadcast(
            Payload::StartRun {
                countdown_seconds,
                run_id,
            },
            now,
        )];
        out.extend(self.advance_countdown(now));
        Ok(out)
    }

    /// Manual start: the clock starts now.
    pub fn start_timing(&mut self, now: i64) -> Result<Vec<Output>, CoordinatorError> {
        let run = self.state.run.as_ref().ok_or(CoordinatorError::NoActiveRun)?;
        if self.state.start_type != StartType::Manual || run.start_signal.is_some() {
            return Err(CoordinatorError::invalid_phase(
                "start timing",
                self.state.phase,
            ));
        }
        let mut out = vec![self.broadcast(Payload::StartTiming {}, now)];
        out.extend(self.fire_start_signal(now, now));
        Ok(out)
    }

    pub fn cancel_run(&mut self, now: i64) -> Result<Vec<Output>, CoordinatorError> {
        let run = self.state.run.take().ok_or(CoordinatorError::NoActiveRun)?;
        info!(run_id = %run.run_id, "run cancelled");
        self.reset_arm_acks();
        self.transition(SessionPhase::Idle);
        Ok(vec![
            Output::CancelRetries {
                run_id: run.run_id.clone(),
            },
            self.broadcast(Payload::CancelRun { run_id: run.run_id }, now),
        ])
    }

    pub fn abort(&mut self, reason: &str, now: i64) -> Vec<Output> {
        let mut out = Vec::new();
        if let Some(run) = self.state.run.take() {
            out.push(Output::CancelRetries { run_id: run.run_id });
        }
        warn!(reason, "session aborted");
        self.reset_arm_acks();
        self.transition(SessionPhase::Aborted);
        out.push(self.broadcast(
            Payload::Abort {
                reason: reason.to_string(),
            },
            now,
        ));
        out
    }

    pub fn end_session(&mut self, reason: &str, now: i64) -> Vec<Output> {
        let mut out = Vec::new();
        if let Some(run) = self.state.run.take() {
            out.push(Output::CancelRetries { run_id: run.run_id });
        }
        info!(reason, "session ended");
        self.transition(SessionPhase::SessionEnded);
        out.push(self.broadcast(
            Payload::SessionEnded {
                reason: reason.to_string(),
            },
            now,
        ));
        out
    }

    pub fn change_start_type(
        &mut self,
        start_type: StartType,
        now: i64,
    ) -> Result<Vec<Output>, CoordinatorError> {
        if self.state.phase.is_running() {
            return Err(CoordinatorError::invalid_phase(
                "change start type",
                self.state.phase,
            ));
        }
        let version = self.state.versions.bump(ConfigType::StartType);
        self.state.start_type = start_type;
        info!(?start_type, version, "start type changed");
        Ok(vec![self.broadcast(
            Payload::StartTypeChanged {
                start_type,
                version,
            },
            now,
        )])
    }

    pub fn change_distances(
        &mut self,
        gate_distances: Vec<GateDistance>,
        now: i64,
    ) -> Result<Vec<Output>, CoordinatorError> {
        if self.state.phase.is_running() {
            return Err(CoordinatorError::invalid_phase(
                "change distances",
                self.state.phase,
            ));
        }
        for d in &gate_distances {
            if !self.state.gates.iter().any(|g| g.gate_id == d.gate_id) {
                return Err(CoordinatorError::UnknownGate {
                    gate_id: d.gate_id.clone(),
                });
            }
        }
        for d in &gate_distances {
            if let Some(gate) = self.state.gates.iter_mut().find(|g| g.gate_id == d.gate_id) {
                gate.distance_meters = d.distance_meters;
            }
        }
        let version = self.state.versions.bump(ConfigType::Distances);
        info!(version, gates = gate_distances.len(), "distances changed");
        Ok(vec![self.broadcast(
            Payload::DistanceConfigChanged {
                gate_distances,
                version,
            },
            now,
        )])
    }

    pub fn adjust_gate_line(
        &mut self,
        gate_id: &str,
        position: f64,
        now: i64,
    ) -> Result<Vec<Output>, CoordinatorError> {
        self.device_for_gate(gate_id)?;
        Ok(vec![self.broadcast(
            Payload::AdjustGateLine {
                gate_id: gate_id.to_string(),
                position: position.clamp(0.0, 1.0),
            },
            now,
        )])
    }

    fn broadcast_control(&mut self, payload: Payload, now: i64) -> Result<Vec<Output>, CoordinatorError> {
        if self.state.phase.is_terminal() {
            return Err(CoordinatorError::invalid_phase(
                payload.case_name(),
                self.state.phase,
            ));
        }
        Ok(vec![self.broadcast(payload, now)])
    }

    // ---------------------------------------------------------------------
    // timing
    // ---------------------------------------------------------------------

    fn on_crossing(&mut self, from: &DeviceId, report: CrossingReport, now: i64) -> Vec<Output> {
        let Some(run) = self.state.run.as_ref() else {
            debug!(gate_id = %report.gate_id, "crossing outside a run ignored");
            return Vec::new();
        };
        if run.run_id != report.run_id {
            debug!(run_id = %report.run_id, "crossing for another run ignored");
            return Vec::new();
        }
        let bound = self
            .state
            .gates
            .iter()
            .find(|g| g.gate_id == report.gate_id)
            .map(|g| g.device_id.as_ref() == Some(from));
        match bound {
            None => {
                warn!(gate_id = %report.gate_id, "crossing for unknown gate");
                return Vec::new();
            }
            Some(false) => {
                warn!(gate_id = %report.gate_id, device = %from, "crossing from unbound device");
                return Vec::new();
            }
            Some(true) => {}
        }
        if run.crossings.contains_key(&report.gate_id) {
            debug!(gate_id = %report.gate_id, "later crossing at gate ignored");
            return Vec::new();
        }

        let crossing = self.project(from, &report.gate_id, report.timestamp_nanos);
        if let Some(conflict) = self.order_conflict(run, &crossing) {
            warn!(
                gate_id = %report.gate_id,
                conflicts_with = %conflict,
                host_nanos = crossing.host_nanos,
                "crossing out of course order rejected"
            );
            metrics::counter!("timing_crossings_rejected_total", "gate" => report.gate_id.clone())
                .increment(1);
            return Vec::new();
        }
        info!(
            gate_id = %report.gate_id,
            role = %report.role,
            confidence = report.confidence,
            host_nanos = crossing.host_nanos,
            uncertainty_ms = crossing.uncertainty_ms,
            "crossing recorded"
        );
        metrics::counter!("timing_crossings_total", "gate" => report.gate_id.clone()).increment(1);

        if let (Some(event_id), Some(data)) = (report.event_id, report.thumbnail_data) {
            if self.thumbnails.len() >= THUMBNAIL_CAPACITY {
                self.thumbnails.pop_first();
            }
            self.thumbnails.insert(event_id, data);
        }
        if let Some(run) = self.state.run.as_mut() {
            run.crossings.insert(report.gate_id.clone(), crossing);
        }
        if report.role == GateRole::Finish && self.state.phase == SessionPhase::RunInProgress {
            self.transition(SessionPhase::ResultPending);
        }
        self.try_complete(false, now)
    }

    /// Gate whose crossing would make a split into or out of `crossing` non-positive.
    fn order_conflict(&self, run: &ActiveRun, crossing: &ProjectedCrossing) -> Option<String> {
        let index_of = |gate_id: &str| {
            self.state
                .gates
                .iter()
                .find(|g| g.gate_id == gate_id)
                .map(|g| g.gate_index)
        };
        let start_mark = self.start_mark(run);
        if self.state.start_type != StartType::Flying && start_mark.is_none() {
            // nothing can cross before the start signal
            return Some("start signal".to_string());
        }
        if start_mark.as_ref().is_some_and(|m| m.gate_id == crossing.gate_id) {
            // the start signal stands in for this gate
            return None;
        }
        let index = index_of(&crossing.gate_id)?;
        let overridden = start_mark.as_ref().map(|m| m.gate_id.as_str());
        run.crossings
            .values()
            .filter(|c| Some(c.gate_id.as_str()) != overridden)
            .chain(start_mark.as_ref())
            .find(|other| match index_of(&other.gate_id) {
                Some(i) if i < index => other.host_nanos >= crossing.host_nanos,
                Some(i) if i > index => other.host_nanos <= crossing.host_nanos,
                _ => false,
            })
            .map(|other| other.gate_id.clone())
    }

    fn project(&self, from: &DeviceId, gate_id: &str, timestamp_nanos: i64) -> ProjectedCrossing {
        let fallback = self.settings.unsynced_uncertainty_ms;
        match self.sync.estimate(from) {
            Some(e) => ProjectedCrossing {
                gate_id: gate_id.to_string(),
                host_nanos: e.to_local(timestamp_nanos),
                uncertainty_ms: if e.synced {
                    e.uncertainty_ms
                } else {
                    e.uncertainty_ms.max(fallback)
                },
                synced: e.synced,
            },
            None => {
                warn!(device = %from, "no clock estimate, crossing taken unprojected");
                ProjectedCrossing {
                    gate_id: gate_id.to_string(),
                    host_nanos: timestamp_nanos,
                    uncertainty_ms: fallback,
                    synced: false,
                }
            }
        }
    }

    fn on_provisional(&mut self, from: &DeviceId, run_id: &str, split_nanos: i64, uncertainty_ms: f64) {
        if let Some(run) = self.state.run.as_mut().filter(|r| r.run_id == run_id) {
            debug!(device = %from, split_nanos, uncertainty_ms, "provisional finish result");
            run.provisional.push((from.clone(), split_nanos));
            return;
        }
        if let Some(record) = self.state.last_record.as_ref().filter(|r| r.run_id == run_id) {
            let delta_ms = (split_nanos - record.total_split_nanos) as f64 / 1e6;
            info!(device = %from, delta_ms, "provisional result after final");
        }
    }

    /// `signal_at` is the scheduled start on the host clock, never after `now`.
    fn fire_start_signal(&mut self, signal_at: i64, now: i64) -> Vec<Output> {
        let Some(run) = self.state.run.as_mut() else {
            return Vec::new();
        };
        if run.start_signal.is_some() {
            return Vec::new();
        }
        let signal_at = signal_at.min(now);
        run.start_signal = Some(signal_at);
        run.countdown = None;
        let run_id = run.run_id.clone();
        info!(run_id = %run_id, "start signal");

        let start = self.broadcast(
            Payload::StartEvent {
                monotonic_nanos: signal_at,
                thumbnail_data: None,
                run_id,
            },
            now,
        );
        let audio = self.broadcast(
            Payload::AudioSyncMetadata {
                start_signal_nanos: signal_at,
                output_latency_nanos: 0,
            },
            now,
        );
        let mut out = vec![start, audio];
        out.extend(self.try_complete(false, now));
        out
    }

    fn advance_countdown(&mut self, now: i64) -> Vec<Output> {
        let mut out = Vec::new();
        loop {
            let Some(countdown) = self.state.run.as_ref().and_then(|r| r.countdown) else {
                return out;
            };
            if countdown.next_at > now {
                return out;
            }
            if countdown.remaining == 0 {
                out.extend(self.fire_start_signal(countdown.next_at, now));
                return out;
            }
            let distance = self.total_distance();
            if let Some(run) = self.state.run.as_mut() {
                run.countdown = Some(Countdown {
                    remaining: countdown.remaining - 1,
                    next_at: countdown.next_at + ONE_SECOND_NANOS,
                });
            }
            out.push(self.broadcast(
                Payload::Countdown {
                    remaining: countdown.remaining,
                    distance: Some(distance),
                },
                now,
            ));
        }
    }

    fn start_mark(&self, run: &ActiveRun) -> Option<ProjectedCrossing> {
        match self.state.start_type {
            StartType::Flying => None,
            StartType::Countdown | StartType::Manual => {
                let start_gate = self.state.gates.iter().find(|g| g.role == GateRole::Start)?;
                run.start_signal.map(|at| ProjectedCrossing {
                    gate_id: start_gate.gate_id.clone(),
                    host_nanos: at,
                    uncertainty_ms: 0.0,
                    synced: true,
                })
            }
        }
    }

    /// Publish the result once start and finish are known.
    ///
    /// Without `force` every lap gate must have fired as well.
    fn try_complete(&mut self, force: bool, now: i64) -> Vec<Output> {
        let Some(run) = self.state.run.as_ref() else {
            return Vec::new();
        };
        let start_mark = self.start_mark(run);
        if self.state.start_type != StartType::Flying && start_mark.is_none() {
            return Vec::new();
        }
        let laps_missing = self
            .state
            .gates
            .iter()
            .any(|g| g.role == GateRole::Lap && !run.crossings.contains_key(&g.gate_id));
        if laps_missing && !force {
            return Vec::new();
        }
        let outcome = match compute_splits(
            &run.run_id,
            &self.state.gates,
            &run.crossings,
            start_mark.as_ref(),
        ) {
            Ok(outcome) => outcome,
            Err(CoordinatorError::IncompleteRun { .. }) => return Vec::new(),
            Err(e) => {
                error!(error = %e, "split computation failed");
                return Vec::new();
            }
        };
        self.publish_result(outcome, now)
    }

    fn publish_result(&mut self, outcome: SplitOutcome, now: i64) -> Vec<Output> {
        let Some(run) = self.state.run.take() else {
            return Vec::new();
        };
        let record = RunRecord {
            session_id: self.state.session_id.clone(),
            run_id: run.run_id.clone(),
            completed_at_unix_ms: chrono::Utc::now().timestamp_millis(),
            start_type: self.state.start_type,
            total_split_nanos: outcome.total_split_nanos,
            total_distance_meters: outcome.total_distance_meters,
            segments: outcome.segments.clone(),
            uncertainty_ms: outcome.uncertainty_ms,
            synced: outcome.synced,
        };
        info!(
            run_id = %record.run_id,
            seconds = record.total_seconds(),
            uncertainty_ms = record.uncertainty_ms,
            synced = record.synced,
            "run completed"
        );
        for (device, split) in &run.provisional {
            let delta_ms = (split - record.total_split_nanos) as f64 / 1e6;
            debug!(device = %device, delta_ms, "provisional vs final");
        }
        metrics::counter!("timing_runs_completed_total").increment(1);
        metrics::histogram!("timing_split_seconds").record(record.total_seconds());

        let broadcast = self.broadcast(
            Payload::TimingResultBroadcast {
                split_nanos: outcome.total_split_nanos,
                uncertainty_ms: outcome.uncertainty_ms,
                start_gate_id: outcome.start_gate_id,
                finish_gate_id: outcome.finish_gate_id,
                run_id: run.run_id.clone(),
            },
            now,
        );
        let multi = self.broadcast(
            Payload::MultiGateResult {
                total_split_nanos: outcome.total_split_nanos,
                segments: outcome.segments,
                uncertainty_ms: outcome.uncertainty_ms,
                run_id: run.run_id,
            },
            now,
        );
        self.reset_arm_acks();
        self.state.last_record = Some(record.clone());
        if self.state.phase == SessionPhase::RunInProgress {
            self.transition(SessionPhase::ResultPending);
        }
        self.transition(SessionPhase::Idle);
        vec![broadcast, multi, Output::RunCompleted(record)]
    }

    // ---------------------------------------------------------------------
    // time
    // ---------------------------------------------------------------------

    pub fn tick(&mut self, now: i64) -> Vec<Output> {
        let mut out = self.advance_countdown(now);

        if let Some(run) = self.state.run.as_ref() {
            if now >= run.deadline {
                let run_id = run.run_id.clone();
                let completed = self.try_complete(true, now);
                if completed.is_empty() {
                    warn!(run_id = %run_id, "run timed out without a result");
                    if let Ok(cancel) = self.cancel_run(now) {
                        out.extend(cancel);
                    }
                } else {
                    out.extend(completed);
                }
            }
        }

        let timeout = self.heartbeat.peer_timeout_nanos();
        let silent: Vec<DeviceId> = self
            .state
            .devices
            .values()
            .filter(|d| d.connected && now - d.last_heard_nanos > timeout)
            .map(|d| d.device_id.clone())
            .collect();
        for device in silent {
            warn!(device = %device, "heartbeat timeout");
            out.extend(self.mark_disconnected(&device, now));
        }
        out
    }

    // ---------------------------------------------------------------------
    // helpers
    // ---------------------------------------------------------------------

    /// Stamp and address a broadcast; replayable ones enter the event log.
    fn broadcast(&mut self, payload: Payload, now: i64) -> Output {
        let mut message = self.builder.build(payload, now);
        if is_replayable(&message.payload) {
            message.event_id = message.message_id.clone();
            self.log.record(&message);
        }
        Output::Send {
            to: self.recipients(),
            message,
        }
    }

    /// Confirmed, reachable participants.
    fn recipients(&self) -> Vec<DeviceId> {
        self.state
            .devices
            .values()
            .filter(|d| d.confirmed && d.connected)
            .map(|d| d.device_id.clone())
            .collect()
    }

    fn all_timing_gates(&self, pred: impl Fn(&DeviceRecord) -> bool) -> bool {
        self.state
            .gates
            .iter()
            .filter(|g| g.role.is_timing())
            .all(|g| {
                g.device_id
                    .as_ref()
                    .and_then(|id| self.state.devices.get(id))
                    .is_some_and(&pred)
            })
    }

    fn unready_gates(&self) -> Vec<String> {
        self.state
            .gates
            .iter()
            .filter(|g| g.role.is_timing())
            .filter(|g| {
                !g.device_id
                    .as_ref()
                    .and_then(|id| self.state.devices.get(id))
                    .is_some_and(DeviceRecord::ready_for_run)
            })
            .map(|g| g.gate_id.clone())
            .collect()
    }

    fn device_for_gate(&self, gate_id: &str) -> Result<DeviceId, CoordinatorError> {
        self.state
            .gates
            .iter()
            .find(|g| g.gate_id == gate_id)
            .and_then(|g| g.device_id.clone())
            .ok_or_else(|| CoordinatorError::UnknownGate {
                gate_id: gate_id.to_string(),
            })
    }

    fn require_phase(
        &self,
        operation: &'static str,
        allowed: &[SessionPhase],
    ) -> Result<(), CoordinatorError> {
        if allowed.contains(&self.state.phase) {
            Ok(())
        } else {
            Err(CoordinatorError::invalid_phase(operation, self.state.phase))
        }
    }

    fn transition(&mut self, next: SessionPhase) {
        let current = self.state.phase;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(from = ?current, to = ?next, "unexpected phase transition");
        }
        debug!(from = ?current, to = ?next, "host phase");
        self.state.phase = next;
    }

    fn reset_arm_acks(&mut self) {
        for device in self.state.devices.values_mut() {
            device.armed_acked = false;
        }
    }

    fn next_run_id(&self) -> String {
        format!("{}-run{}", self.state.session_id, self.state.runs_started + 1)
    }

    fn total_distance(&self) -> f64 {
        let start = self
            .state
            .gates
            .iter()
            .find(|g| g.role == GateRole::Start)
            .map_or(0.0, |g| g.distance_meters);
        self.state
            .gates
            .iter()
            .find(|g| g.role == GateRole::Finish)
            .map_or(0.0, |g| g.distance_meters - start)
    }
}

struct CrossingReport {
    gate_id: String,
    role: GateRole,
    timestamp_nanos: i64,
    confidence: f32,
    thumbnail_data: Option<String>,
    run_id: String,
    event_id: Option<String>,
}

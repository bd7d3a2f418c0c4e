//! ParticipantCoordinator - gate device side of a session
//!
//! Holds a read-only projection of the host's state. Replayable broadcasts are
//! buffered by sender sequence and the projection is always the in-order fold of
//! everything received, so a late or replayed message never lands out of order.
//! Detector commands follow from the difference between two projections.

use std::collections::BTreeMap;
use std::sync::Arc;

use clock_sync::{ClockEstimate, ClockSyncEngine, PingRequest, PongReply};
use contracts::{
    ClockSyncConfig, CrossingEvent, DeviceId, GateAssignment, GateRole, GateStatusInfo,
    HeartbeatConfig, StartType,
};
use crossing_detector::{DetectorCommand, DetectorEvent};
use protocol::{generate_event_id, DebugLevel, EnvelopeBuilder, Payload, TimingMessage};
use tracing::{debug, info, instrument, warn};
use transport::TransportEvent;

use crate::event_log::is_replayable;
use crate::{CoordinatorError, Output, SessionPhase, SessionView};

/// Buffered broadcasts kept above the compacted base.
const PROJECTION_WINDOW: usize = 256;
const THUMBNAIL_CAPACITY: usize = 16;
const CALIBRATION_TIMEOUT_NANOS: i64 = 10_000_000_000;

/// Connection progress before the projection takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Disconnected,
    Connecting,
    Negotiating,
    Confirmed,
}

/// Recalibration awaiting a fresh calibrated status.
#[derive(Debug, Clone, Copy)]
struct Calibration {
    requested_at: i64,
    reset_seen: bool,
}

impl Calibration {
    fn new(requested_at: i64) -> Self {
        Self {
            requested_at,
            reset_seen: false,
        }
    }
}

/// What the host last said about another gate.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerGate {
    pub gate_id: String,
    pub connected: bool,
    pub status: GateStatusInfo,
    seq: u64,
}

/// Immutable copy of participant state for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantSnapshot {
    pub device_id: DeviceId,
    pub phase: SessionPhase,
    pub gate: Option<GateAssignment>,
    pub view: SessionView,
    pub host_reachable: bool,
    pub clock: Option<ClockEstimate>,
    pub local_status: Option<GateStatusInfo>,
    pub countdown: Option<u32>,
    pub all_gates_armed: bool,
    pub peer_gates: Vec<PeerGate>,
    pub crossed_run: Option<String>,
}

/// Local commands for a participant.
#[derive(Debug, Clone, PartialEq)]
pub enum ParticipantCommand {
    /// Start role negotiation with the host
    Connect,
    RelayLog { level: DebugLevel, message: String },
    RequestThumbnail(String),
    RequestEventSync,
}

pub struct ParticipantCoordinator {
    device_name: String,
    requested_role: Option<GateRole>,
    host_id: DeviceId,
    builder: Arc<EnvelopeBuilder>,
    sync: ClockSyncEngine,
    burst_size: u32,
    heartbeat: HeartbeatConfig,
    status_interval_nanos: i64,

    link: Link,
    gate: Option<GateAssignment>,
    gates: Vec<GateAssignment>,
    session_start_type: StartType,

    base: SessionView,
    pending: BTreeMap<u64, TimingMessage>,
    view: SessionView,

    peer_gates: BTreeMap<String, PeerGate>,
    local_status: Option<GateStatusInfo>,
    last_status_sent: Option<(GateStatusInfo, i64)>,
    calibration: Option<Calibration>,
    countdown: Option<u32>,
    all_gates_armed: bool,
    crossed_run: Option<String>,
    thumbnails: BTreeMap<String, String>,

    burst_active: bool,
    last_heard_host: i64,
    host_lost: bool,
    last_heartbeat: Option<i64>,
}

impl ParticipantCoordinator {
    pub fn new(
        device_name: impl Into<String>,
        requested_role: Option<GateRole>,
        host_id: DeviceId,
        builder: Arc<EnvelopeBuilder>,
        clock_sync: ClockSyncConfig,
        heartbeat: HeartbeatConfig,
        status_interval_nanos: i64,
    ) -> Self {
        let burst_size = clock_sync.burst_size.max(1);
        Self {
            device_name: device_name.into(),
            requested_role,
            host_id,
            sync: ClockSyncEngine::new(builder.sender_id().clone(), clock_sync),
            builder,
            burst_size,
            heartbeat,
            status_interval_nanos,
            link: Link::Disconnected,
            gate: None,
            gates: Vec::new(),
            session_start_type: StartType::default(),
            base: SessionView::default(),
            pending: BTreeMap::new(),
            view: SessionView::default(),
            peer_gates: BTreeMap::new(),
            local_status: None,
            last_status_sent: None,
            calibration: None,
            countdown: None,
            all_gates_armed: false,
            crossed_run: None,
            thumbnails: BTreeMap::new(),
            burst_active: false,
            last_heard_host: 0,
            host_lost: false,
            last_heartbeat: None,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        self.builder.sender_id()
    }

    pub fn gate(&self) -> Option<&GateAssignment> {
        self.gate.as_ref()
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    /// Every gate as announced in the session config, distances kept current.
    pub fn gates(&self) -> &[GateAssignment] {
        &self.gates
    }

    pub fn session_start_type(&self) -> StartType {
        self.session_start_type
    }

    pub fn clock_estimate(&self) -> Option<ClockEstimate> {
        self.sync.estimate(&self.host_id)
    }

    pub fn thumbnail(&self, event_id: &str) -> Option<&str> {
        self.thumbnails.get(event_id).map(String::as_str)
    }

    pub fn phase(&self) -> SessionPhase {
        if self.view.phase == SessionPhase::SessionEnded {
            return SessionPhase::SessionEnded;
        }
        match self.link {
            Link::Disconnected => return SessionPhase::Disconnected,
            Link::Connecting => return SessionPhase::Connecting,
            Link::Negotiating => return SessionPhase::RoleNegotiation,
            Link::Confirmed => {}
        }
        if self.host_lost {
            return SessionPhase::Disconnected;
        }
        let crossed_finish = self.view.phase == SessionPhase::RunInProgress
            && self.gate.as_ref().is_some_and(|g| g.role == GateRole::Finish)
            && self.crossed_run.is_some()
            && self.crossed_run == self.view.run_id;
        if crossed_finish {
            SessionPhase::ResultPending
        } else {
            self.view.phase
        }
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            device_id: self.device_id().clone(),
            phase: self.phase(),
            gate: self.gate.clone(),
            view: self.view.clone(),
            host_reachable: !self.host_lost,
            clock: self.clock_estimate(),
            local_status: self.local_status.clone(),
            countdown: self.countdown,
            all_gates_armed: self.all_gates_armed,
            peer_gates: self.peer_gates.values().cloned().collect(),
            crossed_run: self.crossed_run.clone(),
        }
    }

    pub fn handle_command(
        &mut self,
        command: ParticipantCommand,
        now: i64,
    ) -> Result<Vec<Output>, CoordinatorError> {
        match command {
            ParticipantCommand::Connect => Ok(self.connect(now)),
            ParticipantCommand::RelayLog { level, message } => {
                Ok(vec![self.to_host(Payload::DebugLog { level, message }, now)])
            }
            ParticipantCommand::RequestThumbnail(event_id) => {
                self.require_confirmed("request a thumbnail")?;
                Ok(vec![self.to_host(Payload::ThumbnailRequest { event_id }, now)])
            }
            ParticipantCommand::RequestEventSync => {
                self.require_confirmed("request event sync")?;
                Ok(vec![self.event_sync(now)])
            }
        }
    }

    pub fn connect(&mut self, now: i64) -> Vec<Output> {
        if self.link == Link::Disconnected {
            self.link = Link::Connecting;
        }
        self.last_heard_host = now;
        self.last_heartbeat = Some(now);
        info!(host = %self.host_id, "requesting a role");
        vec![self.role_request(now)]
    }

    pub fn handle_transport(&mut self, event: TransportEvent, now: i64) -> Vec<Output> {
        match event {
            TransportEvent::Message { from, message } => self.on_message(&from, message, now),
            TransportEvent::DeliveryFailed(failure) => {
                warn!(case = failure.case, run_id = ?failure.run_id, "host missed a critical message");
                Vec::new()
            }
            TransportEvent::Rejected { from, error } => {
                warn!(from = %from, error = %error, "undecodable message");
                Vec::new()
            }
        }
    }

    #[instrument(
        name = "participant_on_message",
        skip(self, message, now),
        fields(case = message.case_name(), seq = message.seq)
    )]
    pub fn on_message(&mut self, from: &DeviceId, message: TimingMessage, now: i64) -> Vec<Output> {
        if from != &self.host_id {
            debug!(from = %from, "message from a non-host peer ignored");
            return Vec::new();
        }
        if message.session_id != self.builder.session_id() {
            if let Payload::SessionConfig { .. } = message.payload {
                warn!(session = %message.session_id, "session config for another session");
                return vec![self.to_host(Payload::SessionConfigAck { accepted: false }, now)];
            }
            debug!(session = %message.session_id, "message for another session dropped");
            return Vec::new();
        }

        let mut out = self.heard_host(now);

        if is_replayable(&message.payload) {
            out.extend(self.on_broadcast(message, now));
            return out;
        }

        let seq = message.seq;
        match message.payload {
            Payload::SessionConfig {
                start_type,
                countdown_seconds,
                gates,
                ..
            } => {
                if self.link == Link::Connecting {
                    self.link = Link::Negotiating;
                }
                debug!(gates = gates.len(), countdown_seconds, "session config received");
                self.session_start_type = start_type;
                self.gates = gates;
                out.push(self.to_host(Payload::SessionConfigAck { accepted: true }, now));
            }
            Payload::RoleAssigned { device_id, role } => {
                if &device_id == self.device_id() {
                    info!(%role, "role assigned");
                    out.push(self.to_host(Payload::RoleAssignedAck { role }, now));
                }
            }
            Payload::GateAssigned {
                device_id,
                gate_id,
                gate_index,
                distance_meters,
            } => {
                if &device_id == self.device_id() {
                    let role = self
                        .gates
                        .iter()
                        .find(|g| g.gate_id == gate_id)
                        .map(|g| g.role)
                        .or(self.requested_role)
                        .unwrap_or(GateRole::Control);
                    info!(gate_id = %gate_id, gate_index, distance_meters, "gate assigned");
                    self.gate = Some(GateAssignment {
                        gate_id: gate_id.clone(),
                        role,
                        gate_index,
                        distance_meters,
                        device_id: Some(device_id),
                    });
                    out.push(self.to_host(Payload::GateAssignedAck { gate_id }, now));
                }
            }
            Payload::RoleConfirmed {} => out.extend(self.on_confirmed(now)),
            Payload::HeartbeatPong { .. } => {}
            Payload::SyncRequest {} => out.extend(self.start_burst(now)),
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
                out.push(self.to_host(
                    Payload::SyncPong {
                        ping_id: pong.ping_id,
                        t1_nanos: pong.t1_nanos,
                        t2_nanos: pong.t2_nanos,
                        t3_nanos: pong.t3_nanos,
                        requester_id: pong.requester_id,
                    },
                    now,
                ));
            }
            Payload::SyncPong {
                ping_id,
                t1_nanos,
                t2_nanos,
                t3_nanos,
                requester_id,
            } => {
                let pong = PongReply {
                    ping_id,
                    t1_nanos,
                    t2_nanos,
                    t3_nanos,
                    requester_id,
                };
                if let Err(e) = self.sync.handle_pong(from, &pong, now) {
                    debug!(error = %e, "pong dropped");
                }
                out.extend(self.maybe_finish_burst(now));
            }
            Payload::CalibrateRequest {} => {
                self.calibration = Some(Calibration::new(now));
                out.push(Output::Detector(DetectorCommand::Recalibrate));
            }
            Payload::ConfigVersion {
                version,
                config_type,
            } => {
                if version > self.view.versions.current(config_type) {
                    info!(
                        config = config_type.as_str(),
                        version,
                        "local config behind host, requesting event sync"
                    );
                    out.push(self.event_sync(now));
                }
            }
            Payload::EventSyncResponse { events, .. } => {
                debug!(events = events.len(), "replaying missed events");
                for event in events {
                    if event.sender_id == self.host_id && is_replayable(&event.payload) {
                        out.extend(self.on_broadcast(event, now));
                    }
                }
            }
            Payload::GateStatus {
                gate_id,
                status,
                connected,
            } => {
                let newer = self.peer_gates.get(&gate_id).map_or(true, |g| g.seq < seq);
                if newer {
                    if !connected {
                        warn!(gate_id = %gate_id, "gate degraded");
                    }
                    self.peer_gates.insert(
                        gate_id.clone(),
                        PeerGate {
                            gate_id,
                            connected,
                            status,
                            seq,
                        },
                    );
                }
            }
            Payload::Countdown { remaining, .. } => {
                debug!(remaining, "countdown");
                self.countdown = Some(remaining);
            }
            Payload::Armed {} => {
                info!("all gates armed");
                self.all_gates_armed = true;
            }
            Payload::AudioSyncMetadata {
                start_signal_nanos, ..
            } => debug!(start_signal_nanos, "audio sync"),
            Payload::ThumbnailData { event_id, data } => {
                if self.thumbnails.len() >= THUMBNAIL_CAPACITY {
                    self.thumbnails.pop_first();
                }
                self.thumbnails.insert(event_id, data);
            }
            Payload::Nack { message_id, reason } => {
                warn!(message_id = ?message_id, reason = %reason, "nack from host");
            }
            other => debug!(case = other.case_name(), "ignored on participant"),
        }
        out
    }

    fn heard_host(&mut self, now: i64) -> Vec<Output> {
        self.last_heard_host = now;
        if !self.host_lost {
            return Vec::new();
        }
        self.host_lost = false;
        info!(host = %self.host_id, "host reachable again");
        if self.link != Link::Confirmed {
            return Vec::new();
        }
        let mut out = vec![self.event_sync(now)];
        out.extend(self.start_burst(now));
        out
    }

    fn on_confirmed(&mut self, now: i64) -> Vec<Output> {
        if self.link == Link::Confirmed {
            return Vec::new();
        }
        self.link = Link::Confirmed;
        info!(gate = ?self.gate.as_ref().map(|g| &g.gate_id), "role confirmed");
        let mut out = vec![self.event_sync(now)];
        out.extend(self.start_burst(now));
        if let Some(position) = self.own_configured_position() {
            out.push(Output::Detector(DetectorCommand::SetGatePosition(position)));
        }
        out.extend(self.send_status(now));
        out
    }

    fn own_configured_position(&self) -> Option<f64> {
        let gate_id = &self.gate.as_ref()?.gate_id;
        self.view.gate_positions.get(gate_id).copied()
    }

    // ---------------------------------------------------------------------
    // projection
    // ---------------------------------------------------------------------

    /// Buffer one replayable broadcast and refold the projection.
    fn on_broadcast(&mut self, message: TimingMessage, now: i64) -> Vec<Output> {
        let seq = message.seq;
        if seq <= self.base.last_seq || self.pending.contains_key(&seq) {
            debug!(seq, "stale or repeated broadcast");
            return Vec::new();
        }
        let in_order = self
            .pending
            .last_key_value()
            .map_or(true, |(last, _)| *last < seq);
        let is_arm = matches!(message.payload, Payload::ArmAll {});
        let is_calibrate = matches!(message.payload, Payload::CalibrateAll {});

        let before = self.view.clone();
        if in_order {
            self.view.apply(&message);
            self.pending.insert(seq, message);
        } else {
            debug!(seq, "late broadcast, refolding");
            self.pending.insert(seq, message);
            let mut view = self.base.clone();
            for m in self.pending.values() {
                view.apply(m);
            }
            self.view = view;
        }
        self.compact();

        let mut out = self.reconcile(&before);
        if is_calibrate && self.view.calibration_epoch > before.calibration_epoch {
            self.calibration = Some(Calibration::new(now));
        }
        if is_arm && self.view.armed {
            if let Some(gate) = &self.gate {
                let ack = Payload::ArmedAck {
                    gate_id: gate.gate_id.clone(),
                    role: gate.role,
                };
                out.push(self.to_host(ack, now));
            }
        }
        out
    }

    fn compact(&mut self) {
        while self.pending.len() > PROJECTION_WINDOW {
            if let Some((_, oldest)) = self.pending.pop_first() {
                self.base.apply(&oldest);
            }
        }
    }

    /// Detector commands and local bookkeeping implied by a projection change.
    fn reconcile(&mut self, before: &SessionView) -> Vec<Output> {
        let mut out = Vec::new();
        let view = &self.view;

        if view.calibration_epoch > before.calibration_epoch {
            out.push(Output::Detector(DetectorCommand::Recalibrate));
        }
        if view.armed != before.armed {
            out.push(Output::Detector(if view.armed {
                DetectorCommand::Arm
            } else {
                DetectorCommand::Disarm
            }));
        }
        if view.paused != before.paused {
            out.push(Output::Detector(if view.paused {
                DetectorCommand::Pause
            } else {
                DetectorCommand::Resume
            }));
        }
        if let Some(gate) = self.gate.as_mut() {
            let position = view.gate_positions.get(&gate.gate_id);
            if position.is_some() && position != before.gate_positions.get(&gate.gate_id) {
                if let Some(p) = position {
                    out.push(Output::Detector(DetectorCommand::SetGatePosition(*p)));
                }
            }
            if let Some(d) = view.gate_distances.get(&gate.gate_id) {
                gate.distance_meters = *d;
            }
        }
        for gate in self.gates.iter_mut() {
            if let Some(d) = view.gate_distances.get(&gate.gate_id) {
                gate.distance_meters = *d;
            }
        }
        if view.start_type != before.start_type {
            info!(start_type = ?view.start_type, "start type changed");
        }
        if view.run_id != before.run_id {
            self.countdown = None;
            self.all_gates_armed = false;
        }
        if !view.armed {
            self.all_gates_armed = false;
        }
        if view.last_result != before.last_result {
            if let Some(result) = &view.last_result {
                info!(
                    run_id = %result.run_id,
                    seconds = result.total_split_nanos as f64 / 1e9,
                    uncertainty_ms = result.uncertainty_ms,
                    "result received"
                );
            }
        }
        if view.phase != before.phase {
            debug!(from = ?before.phase, to = ?view.phase, "projected phase");
        }
        out
    }

    // ---------------------------------------------------------------------
    // detector
    // ---------------------------------------------------------------------

    pub fn handle_detector(&mut self, event: DetectorEvent, now: i64) -> Vec<Output> {
        match event {
            DetectorEvent::Status { gate_id, status } => self.on_status(&gate_id, status, now),
            DetectorEvent::Crossing { gate_id, event } => self.on_crossing(&gate_id, event, now),
        }
    }

    fn on_status(&mut self, gate_id: &str, status: GateStatusInfo, now: i64) -> Vec<Output> {
        if self.gate.as_ref().is_some_and(|g| g.gate_id != gate_id) {
            debug!(gate_id, "status for a foreign gate");
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some(calibration) = self.calibration.as_mut() {
            // Statuses queued before the reset still read calibrated
            if !status.is_calibrated {
                calibration.reset_seen = true;
            } else if calibration.reset_seen {
                self.calibration = None;
                out.extend(self.calibration_report(true, None, now));
            }
        }
        self.local_status = Some(status);
        out.extend(self.send_status(now));
        out
    }

    fn calibration_report(&mut self, success: bool, error: Option<String>, now: i64) -> Option<Output> {
        let gate_id = self.gate.as_ref()?.gate_id.clone();
        if self.link != Link::Confirmed {
            return None;
        }
        Some(self.to_host(
            Payload::CalibrationStatus {
                gate_id,
                success,
                error,
            },
            now,
        ))
    }

    /// Send the local status if it changed or the refresh interval elapsed.
    fn send_status(&mut self, now: i64) -> Option<Output> {
        if self.link != Link::Confirmed || self.host_lost {
            return None;
        }
        let gate_id = self.gate.as_ref()?.gate_id.clone();
        let status = self.local_status.clone()?;
        let due = match &self.last_status_sent {
            Some((last, at)) => *last != status || now - at >= self.status_interval_nanos,
            None => true,
        };
        if !due {
            return None;
        }
        self.last_status_sent = Some((status.clone(), now));
        Some(self.to_host(
            Payload::GateStatus {
                gate_id,
                status,
                connected: true,
            },
            now,
        ))
    }

    #[instrument(name = "participant_crossing", skip(self, event, now))]
    fn on_crossing(&mut self, gate_id: &str, event: CrossingEvent, now: i64) -> Vec<Output> {
        let Some(gate) = self.gate.clone().filter(|g| g.gate_id == gate_id) else {
            warn!("crossing for an unassigned gate dropped");
            return Vec::new();
        };
        let Some(run_id) = self.view.run_id.clone() else {
            debug!("crossing with no run");
            return Vec::new();
        };
        if self.view.phase != SessionPhase::RunInProgress || self.view.paused || self.host_lost {
            debug!(phase = ?self.view.phase, paused = self.view.paused, "crossing outside a timed run");
            return Vec::new();
        }
        if self.last_crossed(&run_id) {
            debug!(run_id = %run_id, "gate already crossed this run");
            return Vec::new();
        }
        self.crossed_run = Some(run_id.clone());

        let event_id = generate_event_id(&run_id, gate_id, event.timestamp_nanos);
        info!(
            run_id = %run_id,
            event_id = %event_id,
            confidence = event.confidence,
            "crossing"
        );
        let crossing = self.builder.build_with_event(
            Payload::CrossingEvent {
                gate_id: gate.gate_id.clone(),
                role: gate.role,
                gate_index: gate.gate_index,
                timestamp_nanos: event.timestamp_nanos,
                confidence: event.confidence,
                thumbnail_data: event.thumbnail.clone(),
                run_id: run_id.clone(),
            },
            Some(event_id),
            now,
        );
        let mut out = vec![Output::send_to(&self.host_id, crossing)];

        if gate.role == GateRole::Finish {
            out.extend(self.provisional_result(&run_id, &event, now));
        }
        out
    }

    fn last_crossed(&self, run_id: &str) -> bool {
        self.crossed_run.as_deref() == Some(run_id)
    }

    /// Finish-gate split from the broadcast start signal and the local estimate.
    fn provisional_result(&mut self, run_id: &str, event: &CrossingEvent, now: i64) -> Option<Output> {
        let start = self.view.start_nanos_host?;
        let estimate = self.clock_estimate()?;
        let split_nanos = estimate.to_peer(event.timestamp_nanos) - start;
        debug!(split_nanos, uncertainty_ms = estimate.uncertainty_ms, "provisional split");
        Some(self.to_host(
            Payload::FinishResult {
                split_nanos,
                uncertainty_ms: estimate.uncertainty_ms,
                image_data: event.thumbnail.clone(),
                run_id: run_id.to_string(),
            },
            now,
        ))
    }

    // ---------------------------------------------------------------------
    // clock sync and liveness
    // ---------------------------------------------------------------------

    fn start_burst(&mut self, now: i64) -> Vec<Output> {
        if self.link != Link::Confirmed {
            return Vec::new();
        }
        self.burst_active = true;
        let host = self.host_id.clone();
        (0..self.burst_size)
            .map(|_| {
                let ping = self.sync.begin_ping(&host, now);
                self.to_host(
                    Payload::SyncPing {
                        ping_id: ping.ping_id,
                        t1_nanos: ping.t1_nanos,
                        requester_id: ping.requester_id,
                    },
                    now,
                )
            })
            .collect()
    }

    fn maybe_finish_burst(&mut self, now: i64) -> Option<Output> {
        if !self.burst_active || self.sync.pending_for(&self.host_id) > 0 {
            return None;
        }
        self.burst_active = false;
        let estimate = self.sync.estimate(&self.host_id)?;
        info!(
            offset_ms = estimate.offset_nanos as f64 / 1e6,
            uncertainty_ms = estimate.uncertainty_ms,
            samples = estimate.samples,
            synced = estimate.synced,
            "clock sync complete"
        );
        Some(self.to_host(
            Payload::SyncComplete {
                offset_nanos: estimate.offset_nanos,
                uncertainty_ms: estimate.uncertainty_ms,
            },
            now,
        ))
    }

    pub fn tick(&mut self, now: i64) -> Vec<Output> {
        let mut out = Vec::new();
        if self.link == Link::Disconnected {
            return out;
        }

        if self.sync.expire_pending(now) > 0 {
            debug!("sync pings expired");
        }
        out.extend(self.maybe_finish_burst(now));
        self.sync.prune(now);

        if !self.host_lost && now - self.last_heard_host > self.heartbeat.peer_timeout_nanos() {
            warn!(host = %self.host_id, "host heartbeat timeout");
            self.host_lost = true;
        }

        let heartbeat_due = self
            .last_heartbeat
            .map_or(true, |at| now - at >= self.heartbeat.interval_nanos());
        if heartbeat_due {
            self.last_heartbeat = Some(now);
            if self.link == Link::Confirmed {
                out.push(self.to_host(Payload::HeartbeatPing {}, now));
                if !self.burst_active && self.sync.needs_resync(&self.host_id, now) {
                    out.extend(self.start_burst(now));
                }
            } else {
                out.push(self.role_request(now));
            }
        }

        if let Some(calibration) = self.calibration {
            if now - calibration.requested_at > CALIBRATION_TIMEOUT_NANOS {
                self.calibration = None;
                warn!("calibration timed out");
                out.extend(self.calibration_report(false, Some("calibration timed out".into()), now));
            }
        }
        out.extend(self.send_status(now));
        out
    }

    // ---------------------------------------------------------------------
    // helpers
    // ---------------------------------------------------------------------

    fn role_request(&self, now: i64) -> Output {
        self.to_host(
            Payload::RoleRequest {
                device_name: self.device_name.clone(),
                requested_role: self.requested_role,
            },
            now,
        )
    }

    fn event_sync(&self, now: i64) -> Output {
        self.to_host(
            Payload::EventSync {
                last_seen_event_id: self.view.last_event_id.clone(),
                run_id: self.view.run_id.clone().unwrap_or_default(),
            },
            now,
        )
    }

    fn to_host(&self, payload: Payload, now: i64) -> Output {
        Output::send_to(&self.host_id, self.builder.build(payload, now))
    }

    fn require_confirmed(&self, operation: &'static str) -> Result<(), CoordinatorError> {
        if self.link == Link::Confirmed {
            Ok(())
        } else {
            Err(CoordinatorError::invalid_phase(operation, self.phase()))
        }
    }
}

//! Closed payload catalogue.
//!
//! Every case serializes as a single-key object `{ "<caseName>": { ..fields } }`.
//! Cases without fields are written as `{ "<caseName>": {} }`.

use contracts::{
    DeviceId, GateAssignment, GateDistance, GateRole, GateStatusInfo, SegmentSplit, StartType,
};
use serde::{Deserialize, Serialize};

use crate::TimingMessage;

/// Config families that carry independent version counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigType {
    StartType,
    Distances,
}

impl ConfigType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigType::StartType => "startType",
            ConfigType::Distances => "distances",
        }
    }
}

/// Severity of a relayed debug line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DebugLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Payload {
    // handshake
    SessionConfig {
        host_id: DeviceId,
        start_type: StartType,
        countdown_seconds: u32,
        gates: Vec<GateAssignment>,
    },
    SessionConfigAck {
        accepted: bool,
    },
    RoleRequest {
        device_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested_role: Option<GateRole>,
    },
    RoleAssigned {
        device_id: DeviceId,
        role: GateRole,
    },
    GateAssigned {
        device_id: DeviceId,
        gate_id: String,
        gate_index: u32,
        distance_meters: f64,
    },
    RoleAssignedAck {
        role: GateRole,
    },
    GateAssignedAck {
        gate_id: String,
    },
    RoleConfirmed {},

    // delivery
    Ack {
        message_id: String,
    },
    Nack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        reason: String,
    },

    // liveness
    HeartbeatPing {},
    HeartbeatPong {
        ping_seq: u64,
    },

    // clock sync
    SyncPing {
        ping_id: String,
        t1_nanos: i64,
        requester_id: DeviceId,
    },
    SyncPong {
        ping_id: String,
        t1_nanos: i64,
        t2_nanos: i64,
        t3_nanos: i64,
        requester_id: DeviceId,
    },
    SyncRequest {},
    SyncComplete {
        offset_nanos: i64,
        uncertainty_ms: f64,
    },

    // session control
    Countdown {
        remaining: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance: Option<f64>,
    },
    Armed {},
    Abort {
        reason: String,
    },
    NewRun {
        run_id: String,
    },
    CancelRun {
        run_id: String,
    },
    SessionEnded {
        reason: String,
    },
    CalibrateRequest {},
    StartTiming {},
    CalibrateAll {},
    CalibrationStatus {
        gate_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ArmAll {},
    ArmedAck {
        gate_id: String,
        role: GateRole,
    },
    DisarmAll {},
    StartRun {
        countdown_seconds: u32,
        run_id: String,
    },
    GateStatus {
        gate_id: String,
        status: GateStatusInfo,
        connected: bool,
    },
    PauseDetection {},
    ResumeDetection {},

    // timing
    StartEvent {
        monotonic_nanos: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbnail_data: Option<String>,
        run_id: String,
    },
    CrossingEvent {
        gate_id: String,
        role: GateRole,
        gate_index: u32,
        timestamp_nanos: i64,
        confidence: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbnail_data: Option<String>,
        run_id: String,
    },
    FinishResult {
        split_nanos: i64,
        uncertainty_ms: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_data: Option<String>,
        run_id: String,
    },
    TimingResultBroadcast {
        split_nanos: i64,
        uncertainty_ms: f64,
        start_gate_id: String,
        finish_gate_id: String,
        run_id: String,
    },
    MultiGateResult {
        total_split_nanos: i64,
        segments: Vec<SegmentSplit>,
        uncertainty_ms: f64,
        run_id: String,
    },

    // mid-session config
    AdjustGateLine {
        gate_id: String,
        position: f64,
    },
    StartTypeChanged {
        start_type: StartType,
        version: u64,
    },
    DistanceConfigChanged {
        gate_distances: Vec<GateDistance>,
        version: u64,
    },
    ConfigVersion {
        version: u64,
        config_type: ConfigType,
    },

    // reconciliation
    EventSync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen_event_id: Option<String>,
        run_id: String,
    },
    EventSyncResponse {
        events: Vec<TimingMessage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_event_id: Option<String>,
    },

    // auxiliary
    DebugLog {
        level: DebugLevel,
        message: String,
    },
    AudioSyncMetadata {
        start_signal_nanos: i64,
        output_latency_nanos: i64,
    },
    ThumbnailRequest {
        event_id: String,
    },
    ThumbnailData {
        event_id: String,
        data: String,
    },
}

/// Generates [`CASE_NAMES`] and [`Payload::case_name`] from one table so the
/// two cannot drift apart.
macro_rules! payload_cases {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Wire names of every case, in declaration order.
        pub const CASE_NAMES: &[&str] = &[$($name),*];

        impl Payload {
            /// Wire key of this case.
            pub fn case_name(&self) -> &'static str {
                match self {
                    $(Payload::$variant { .. } => $name,)*
                }
            }
        }
    };
}

payload_cases! {
    SessionConfig => "sessionConfig",
    SessionConfigAck => "sessionConfigAck",
    RoleRequest => "roleRequest",
    RoleAssigned => "roleAssigned",
    GateAssigned => "gateAssigned",
    RoleAssignedAck => "roleAssignedAck",
    GateAssignedAck => "gateAssignedAck",
    RoleConfirmed => "roleConfirmed",
    Ack => "ack",
    Nack => "nack",
    HeartbeatPing => "heartbeatPing",
    HeartbeatPong => "heartbeatPong",
    SyncPing => "syncPing",
    SyncPong => "syncPong",
    SyncRequest => "syncRequest",
    SyncComplete => "syncComplete",
    Countdown => "countdown",
    Armed => "armed",
    Abort => "abort",
    NewRun => "newRun",
    CancelRun => "cancelRun",
    SessionEnded => "sessionEnded",
    CalibrateRequest => "calibrateRequest",
    StartTiming => "startTiming",
    CalibrateAll => "calibrateAll",
    CalibrationStatus => "calibrationStatus",
    ArmAll => "armAll",
    ArmedAck => "armedAck",
    DisarmAll => "disarmAll",
    StartRun => "startRun",
    GateStatus => "gateStatus",
    PauseDetection => "pauseDetection",
    ResumeDetection => "resumeDetection",
    StartEvent => "startEvent",
    CrossingEvent => "crossingEvent",
    FinishResult => "finishResult",
    TimingResultBroadcast => "timingResultBroadcast",
    MultiGateResult => "multiGateResult",
    AdjustGateLine => "adjustGateLine",
    StartTypeChanged => "startTypeChanged",
    DistanceConfigChanged => "distanceConfigChanged",
    ConfigVersion => "configVersion",
    EventSync => "eventSync",
    EventSyncResponse => "eventSyncResponse",
    DebugLog => "debugLog",
    AudioSyncMetadata => "audioSyncMetadata",
    ThumbnailRequest => "thumbnailRequest",
    ThumbnailData => "thumbnailData",
}

impl Payload {
    pub fn is_known_case(name: &str) -> bool {
        CASE_NAMES.contains(&name)
    }

    /// Whether delivery of this case must be confirmed with an `ack`.
    ///
    /// State transitions and timing results are critical. Informational,
    /// heartbeat, clock-sync and request/response traffic is not.
    pub fn requires_ack(&self) -> bool {
        match self {
            Payload::SessionConfig { .. }
            | Payload::RoleAssigned { .. }
            | Payload::GateAssigned { .. }
            | Payload::Abort { .. }
            | Payload::NewRun { .. }
            | Payload::CancelRun { .. }
            | Payload::SessionEnded { .. }
            | Payload::StartTiming {}
            | Payload::CalibrateAll {}
            | Payload::ArmAll {}
            | Payload::DisarmAll {}
            | Payload::StartRun { .. }
            | Payload::PauseDetection {}
            | Payload::ResumeDetection {}
            | Payload::StartEvent { .. }
            | Payload::CrossingEvent { .. }
            | Payload::FinishResult { .. }
            | Payload::TimingResultBroadcast { .. }
            | Payload::MultiGateResult { .. }
            | Payload::AdjustGateLine { .. }
            | Payload::StartTypeChanged { .. }
            | Payload::DistanceConfigChanged { .. } => true,

            Payload::SessionConfigAck { .. }
            | Payload::RoleRequest { .. }
            | Payload::RoleAssignedAck { .. }
            | Payload::GateAssignedAck { .. }
            | Payload::RoleConfirmed {}
            | Payload::Ack { .. }
            | Payload::Nack { .. }
            | Payload::HeartbeatPing {}
            | Payload::HeartbeatPong { .. }
            | Payload::SyncPing { .. }
            | Payload::SyncPong { .. }
            | Payload::SyncRequest {}
            | Payload::SyncComplete { .. }
            | Payload::Countdown { .. }
            | Payload::Armed {}
            | Payload::CalibrateRequest {}
            | Payload::CalibrationStatus { .. }
            | Payload::ArmedAck { .. }
            | Payload::GateStatus { .. }
            | Payload::ConfigVersion { .. }
            | Payload::EventSync { .. }
            | Payload::EventSyncResponse { .. }
            | Payload::DebugLog { .. }
            | Payload::AudioSyncMetadata { .. }
            | Payload::ThumbnailRequest { .. }
            | Payload::ThumbnailData { .. } => false,
        }
    }

    /// Run this payload belongs to, if it is run-scoped.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Payload::NewRun { run_id }
            | Payload::CancelRun { run_id }
            | Payload::StartRun { run_id, .. }
            | Payload::StartEvent { run_id, .. }
            | Payload::CrossingEvent { run_id, .. }
            | Payload::FinishResult { run_id, .. }
            | Payload::TimingResultBroadcast { run_id, .. }
            | Payload::MultiGateResult { run_id, .. }
            | Payload::EventSync { run_id, .. } => Some(run_id),
            _ => None,
        }
    }
}

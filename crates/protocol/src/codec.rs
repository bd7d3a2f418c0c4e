//! Canonical JSON wire codec.

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::{Payload, ProtocolError, TimingMessage, PROTOCOL_VERSION};

pub fn encode(message: &TimingMessage) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode one envelope.
///
/// The protocol version and the payload case key are checked before any
/// payload field is parsed, so an unknown case always surfaces as
/// [`ProtocolError::UnknownCase`].
pub fn decode(bytes: &[u8]) -> Result<TimingMessage, ProtocolError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let envelope = value
        .as_object()
        .ok_or_else(|| ProtocolError::malformed("envelope is not an object"))?;

    let version = envelope
        .get("protocolVersion")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::malformed("missing protocolVersion"))?;
    if version != u64::from(PROTOCOL_VERSION) {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: version,
        });
    }

    let payload = envelope
        .get("payload")
        .and_then(Value::as_object)
        .ok_or_else(|| ProtocolError::malformed("payload is not an object"))?;
    let mut keys = payload.keys();
    let case = match (keys.next(), keys.next()) {
        (Some(case), None) => case,
        _ => {
            return Err(ProtocolError::malformed(
                "payload must hold exactly one case key",
            ))
        }
    };
    if !Payload::is_known_case(case) {
        return Err(ProtocolError::UnknownCase { case: case.clone() });
    }

    let message: TimingMessage = serde_json::from_value(value)?;
    debug!(
        case = message.case_name(),
        sender = %message.sender_id,
        seq = message.seq,
        "decoded message"
    );
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigType, DebugLevel, EnvelopeBuilder, CASE_NAMES};
    use contracts::{
        DeviceId, GateAssignment, GateDistance, GateRole, GateStatusInfo, SegmentSplit, StartType,
    };
    use std::collections::BTreeSet;

    fn gate(id: &str, role: GateRole, index: u32, distance: f64) -> GateAssignment {
        GateAssignment {
            gate_id: id.into(),
            role,
            gate_index: index,
            distance_meters: distance,
            device_id: Some(DeviceId::from(format!("dev-{id}"))),
        }
    }

    fn split() -> SegmentSplit {
        SegmentSplit {
            from_gate_id: "start".into(),
            to_gate_id: "finish".into(),
            from_index: 0,
            to_index: 1,
            distance_meters: 30.0,
            split_nanos: 4_120_000_000,
            cumulative_nanos: 4_120_000_000,
            cumulative_distance_meters: 30.0,
            speed_mps: 7.281_553_398_058_252,
            uncertainty_ms: 1.5,
        }
    }

    fn inner_message() -> TimingMessage {
        EnvelopeBuilder::new(DeviceId::from("host"), "s1").build(
            Payload::NewRun {
                run_id: "r1".into(),
            },
            7,
        )
    }

    /// One instance of every case.
    fn every_payload() -> Vec<Payload> {
        let host = DeviceId::from("host");
        vec![
            Payload::SessionConfig {
                host_id: host.clone(),
                start_type: StartType::Countdown,
                countdown_seconds: 3,
                gates: vec![
                    gate("start", GateRole::Start, 0, 0.0),
                    gate("finish", GateRole::Finish, 1, 30.0),
                ],
            },
            Payload::SessionConfigAck { accepted: true },
            Payload::RoleRequest {
                device_name: "pixel".into(),
                requested_role: Some(GateRole::Finish),
            },
            Payload::RoleAssigned {
                device_id: "gate-a".into(),
                role: GateRole::Start,
            },
            Payload::GateAssigned {
                device_id: "gate-a".into(),
                gate_id: "start".into(),
                gate_index: 0,
                distance_meters: 0.0,
            },
            Payload::RoleAssignedAck {
                role: GateRole::Start,
            },
            Payload::GateAssignedAck {
                gate_id: "start".into(),
            },
            Payload::RoleConfirmed {},
            Payload::Ack {
                message_id: "host-4".into(),
            },
            Payload::Nack {
                message_id: None,
                reason: "not calibrated".into(),
            },
            Payload::HeartbeatPing {},
            Payload::HeartbeatPong { ping_seq: 42 },
            Payload::SyncPing {
                ping_id: "gate-a-1".into(),
                t1_nanos: 1_000,
                requester_id: "gate-a".into(),
            },
            Payload::SyncPong {
                ping_id: "gate-a-1".into(),
                t1_nanos: 1_000,
                t2_nanos: 501_000,
                t3_nanos: 502_000,
                requester_id: "gate-a".into(),
            },
            Payload::SyncRequest {},
            Payload::SyncComplete {
                offset_nanos: -250_000,
                uncertainty_ms: 0.75,
            },
            Payload::Countdown {
                remaining: 2,
                distance: Some(30.0),
            },
            Payload::Armed {},
            Payload::Abort {
                reason: "false start".into(),
            },
            Payload::NewRun {
                run_id: "r1".into(),
            },
            Payload::CancelRun {
                run_id: "r1".into(),
            },
            Payload::SessionEnded {
                reason: "done".into(),
            },
            Payload::CalibrateRequest {},
            Payload::StartTiming {},
            Payload::CalibrateAll {},
            Payload::CalibrationStatus {
                gate_id: "finish".into(),
                success: false,
                error: Some("gate line occluded".into()),
            },
            Payload::ArmAll {},
            Payload::ArmedAck {
                gate_id: "finish".into(),
                role: GateRole::Finish,
            },
            Payload::DisarmAll {},
            Payload::StartRun {
                countdown_seconds: 3,
                run_id: "r1".into(),
            },
            Payload::GateStatus {
                gate_id: "finish".into(),
                status: GateStatusInfo {
                    is_calibrated: true,
                    is_armed: true,
                    is_clear: true,
                    is_prebuffer_ready: true,
                    is_stable: false,
                    gate_position: 0.45,
                    battery_level: Some(0.5),
                },
                connected: true,
            },
            Payload::PauseDetection {},
            Payload::ResumeDetection {},
            Payload::StartEvent {
                monotonic_nanos: 9_000_000_000,
                thumbnail_data: None,
                run_id: "r1".into(),
            },
            Payload::CrossingEvent {
                gate_id: "finish".into(),
                role: GateRole::Finish,
                gate_index: 1,
                timestamp_nanos: 13_120_000_000,
                confidence: 0.875,
                thumbnail_data: Some("/9j/4AAQ".into()),
                run_id: "r1".into(),
            },
            Payload::FinishResult {
                split_nanos: 4_120_000_000,
                uncertainty_ms: 2.0,
                image_data: None,
                run_id: "r1".into(),
            },
            Payload::TimingResultBroadcast {
                split_nanos: 4_120_000_000,
                uncertainty_ms: 1.5,
                start_gate_id: "start".into(),
                finish_gate_id: "finish".into(),
                run_id: "r1".into(),
            },
            Payload::MultiGateResult {
                total_split_nanos: 4_120_000_000,
                segments: vec![split()],
                uncertainty_ms: 1.5,
                run_id: "r1".into(),
            },
            Payload::AdjustGateLine {
                gate_id: "finish".into(),
                position: 0.55,
            },
            Payload::StartTypeChanged {
                start_type: StartType::Manual,
                version: 2,
            },
            Payload::DistanceConfigChanged {
                gate_distances: vec![GateDistance {
                    gate_id: "finish".into(),
                    distance_meters: 40.0,
                }],
                version: 5,
            },
            Payload::ConfigVersion {
                version: 5,
                config_type: ConfigType::Distances,
            },
            Payload::EventSync {
                last_seen_event_id: Some("r1_start_9000000000".into()),
                run_id: "r1".into(),
            },
            Payload::EventSyncResponse {
                events: vec![inner_message()],
                from_event_id: None,
            },
            Payload::DebugLog {
                level: DebugLevel::Warn,
                message: "exposure clipped".into(),
            },
            Payload::AudioSyncMetadata {
                start_signal_nanos: 9_000_000_000,
                output_latency_nanos: 12_000_000,
            },
            Payload::ThumbnailRequest {
                event_id: "r1_finish_13120000000".into(),
            },
            Payload::ThumbnailData {
                event_id: "r1_finish_13120000000".into(),
                data: "/9j/4AAQ".into(),
            },
        ]
    }

    #[test]
    fn test_catalogue_is_covered() {
        let sampled: BTreeSet<_> = every_payload().iter().map(Payload::case_name).collect();
        let declared: BTreeSet<_> = CASE_NAMES.iter().copied().collect();
        assert_eq!(sampled, declared);
        assert_eq!(CASE_NAMES.len(), 48);
    }

    #[test]
    fn test_every_case_round_trips() {
        let builder = EnvelopeBuilder::new(DeviceId::from("gate-a"), "s1");
        for (i, payload) in every_payload().into_iter().enumerate() {
            let message = builder.build_with_event(payload, Some(format!("e{i}")), i as i64);
            let bytes = encode(&message).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, message, "case {}", message.case_name());
        }
    }

    #[test]
    fn test_payload_is_single_key_case_name() {
        let builder = EnvelopeBuilder::new(DeviceId::from("gate-a"), "s1");
        for payload in every_payload() {
            let name = payload.case_name();
            let value = serde_json::to_value(builder.build(payload, 0)).unwrap();
            let object = value["payload"].as_object().unwrap();
            assert_eq!(object.len(), 1);
            assert!(object.contains_key(name), "missing key {name}");
        }
    }

    #[test]
    fn test_wire_shape() {
        let builder = EnvelopeBuilder::new(DeviceId::from("host"), "s1");
        let message = builder.build(Payload::HeartbeatPong { ping_seq: 3 }, 55);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "protocolVersion": 1,
                "seq": 1,
                "senderId": "host",
                "sessionId": "s1",
                "payload": { "heartbeatPong": { "pingSeq": 3 } },
                "createdAtNanos": 55
            })
        );

        let unit = serde_json::to_value(builder.build(Payload::ArmAll {}, 0)).unwrap();
        assert_eq!(unit["payload"], serde_json::json!({ "armAll": {} }));
        assert_eq!(unit["messageId"], "host-2");
    }

    #[test]
    fn test_unknown_case_is_distinct_error() {
        let raw = br#"{"protocolVersion":1,"seq":1,"senderId":"x","sessionId":"s",
            "payload":{"teleport":{"to":"mars"}},"createdAtNanos":0}"#;
        match decode(raw) {
            Err(ProtocolError::UnknownCase { case }) => assert_eq!(case, "teleport"),
            other => panic!("expected UnknownCase, got {other:?}"),
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let raw = br#"{"protocolVersion":9,"seq":1,"senderId":"x","sessionId":"s",
            "payload":{"armAll":{}},"createdAtNanos":0}"#;
        assert!(matches!(
            decode(raw),
            Err(ProtocolError::VersionMismatch { expected: 1, found: 9 })
        ));
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(decode(b"not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(decode(b"[1,2]"), Err(ProtocolError::Malformed { .. })));

        let two_keys = br#"{"protocolVersion":1,"seq":1,"senderId":"x","sessionId":"s",
            "payload":{"armAll":{},"disarmAll":{}},"createdAtNanos":0}"#;
        assert!(matches!(decode(two_keys), Err(ProtocolError::Malformed { .. })));

        let bad_fields = br#"{"protocolVersion":1,"seq":1,"senderId":"x","sessionId":"s",
            "payload":{"heartbeatPong":{"pingSeq":"three"}},"createdAtNanos":0}"#;
        assert!(matches!(decode(bad_fields), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_requires_ack_classification() {
        assert!(Payload::ArmAll {}.requires_ack());
        assert!(Payload::CancelRun { run_id: "r".into() }.requires_ack());
        assert!(Payload::PauseDetection {}.requires_ack());
        assert!(!Payload::HeartbeatPing {}.requires_ack());
        assert!(!Payload::Ack {
            message_id: "m".into()
        }
        .requires_ack());
        assert!(!Payload::DebugLog {
            level: DebugLevel::Info,
            message: String::new()
        }
        .requires_ack());
    }
}

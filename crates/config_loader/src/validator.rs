//! Blueprint validation
//!
//! Field ranges come from the `validator` derives on each section; the
//! course-level rules live here:
//! - gate ids, indices and bound devices are unique
//! - exactly one start and one finish gate, at the lowest and highest index
//! - distances strictly increase with index (control gates are ignored)
//! - detector thresholds are ordered
//! - sink names are unique and queues non-empty

use std::collections::HashSet;

use contracts::{ContractError, GateConfig, GateRole, TimingBlueprint};
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Returns the first violation found.
pub fn validate(blueprint: &TimingBlueprint) -> Result<(), ContractError> {
    validate_sections(blueprint)?;
    validate_gate_ids(blueprint)?;
    validate_gate_roles(blueprint)?;
    validate_gate_order(blueprint)?;
    validate_detector(blueprint)?;
    validate_liveness(blueprint)?;
    validate_sinks(blueprint)?;
    Ok(())
}

fn validate_sections(blueprint: &TimingBlueprint) -> Result<(), ContractError> {
    check("session", blueprint.session.validate())?;
    check("detector", blueprint.detector.validate())?;
    check("clock_sync", blueprint.clock_sync.validate())?;
    check("retry", blueprint.retry.validate())?;
    check("heartbeat", blueprint.heartbeat.validate())?;
    for gate in &blueprint.gates {
        check(&format!("gates[id={}]", gate.id), gate.validate())?;
    }
    Ok(())
}

fn check(section: &str, result: Result<(), ValidationErrors>) -> Result<(), ContractError> {
    match result {
        Ok(()) => Ok(()),
        Err(errors) => {
            let (field, message) = first_violation(section, &errors)
                .unwrap_or_else(|| (section.to_string(), errors.to_string()));
            Err(ContractError::config_validation(field, message))
        }
    }
}

/// Walk nested errors in field order and report the first leaf.
fn first_violation(prefix: &str, errors: &ValidationErrors) -> Option<(String, String)> {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    for (name, kind) in fields {
        let path = format!("{prefix}.{name}");
        match kind {
            ValidationErrorsKind::Field(list) => {
                if let Some(e) = list.first() {
                    let message = match &e.message {
                        Some(m) => m.to_string(),
                        None => format!("failed '{}' check ({})", e.code, describe_params(e)),
                    };
                    return Some((path, message));
                }
            }
            ValidationErrorsKind::Struct(inner) => {
                if let Some(found) = first_violation(&path, inner) {
                    return Some(found);
                }
            }
            ValidationErrorsKind::List(items) => {
                for (idx, inner) in items {
                    if let Some(found) = first_violation(&format!("{path}[{idx}]"), inner) {
                        return Some(found);
                    }
                }
            }
        }
    }
    None
}

fn describe_params(error: &validator::ValidationError) -> String {
    let mut params: Vec<String> = error
        .params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    params.sort();
    params.join(", ")
}

fn validate_gate_ids(blueprint: &TimingBlueprint) -> Result<(), ContractError> {
    let mut ids = HashSet::new();
    let mut indices = HashSet::new();
    let mut devices = HashSet::new();

    for gate in &blueprint.gates {
        if !ids.insert(gate.id.as_str()) {
            return Err(ContractError::config_validation(
                format!("gates[id={}]", gate.id),
                "duplicate gate id",
            ));
        }
        if !indices.insert(gate.index) {
            return Err(ContractError::config_validation(
                format!("gates[id={}].index", gate.id),
                format!("duplicate gate index {}", gate.index),
            ));
        }
        if let Some(device) = &gate.device_id {
            if *device == blueprint.session.host_id {
                return Err(ContractError::config_validation(
                    format!("gates[id={}].device_id", gate.id),
                    "the host device cannot own a gate",
                ));
            }
            if !devices.insert(device.clone()) {
                return Err(ContractError::config_validation(
                    format!("gates[id={}].device_id", gate.id),
                    format!("device '{device}' already owns a gate"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_gate_roles(blueprint: &TimingBlueprint) -> Result<(), ContractError> {
    for role in [GateRole::Start, GateRole::Finish] {
        let count = blueprint.gates.iter().filter(|g| g.role == role).count();
        if count != 1 {
            return Err(ContractError::config_validation(
                "gates",
                format!("expected exactly one {role} gate, found {count}"),
            ));
        }
    }
    Ok(())
}

fn validate_gate_order(blueprint: &TimingBlueprint) -> Result<(), ContractError> {
    let mut gates: Vec<&GateConfig> = blueprint
        .gates
        .iter()
        .filter(|g| g.role.is_timing())
        .collect();
    gates.sort_by_key(|g| g.index);

    if let Some(first) = gates.first() {
        if first.role != GateRole::Start {
            return Err(ContractError::config_validation(
                format!("gates[id={}].index", first.id),
                "the start gate must have the lowest index",
            ));
        }
    }
    if let Some(last) = gates.last() {
        if last.role != GateRole::Finish {
            return Err(ContractError::config_validation(
                format!("gates[id={}].index", last.id),
                "the finish gate must have the highest index",
            ));
        }
    }
    for pair in gates.windows(2) {
        if pair[1].distance_m <= pair[0].distance_m {
            return Err(ContractError::config_validation(
                format!("gates[id={}].distance_m", pair[1].id),
                format!(
                    "distance {} must exceed {} of gate '{}'",
                    pair[1].distance_m, pair[0].distance_m, pair[0].id
                ),
            ));
        }
    }
    Ok(())
}

fn validate_detector(blueprint: &TimingBlueprint) -> Result<(), ContractError> {
    let detector = &blueprint.detector;
    if detector.diff_threshold_min > detector.diff_threshold_max {
        return Err(ContractError::config_validation(
            "detector.diff_threshold_min / detector.diff_threshold_max",
            format!(
                "diff_threshold_min ({}) must be <= diff_threshold_max ({})",
                detector.diff_threshold_min, detector.diff_threshold_max
            ),
        ));
    }
    if detector.thumbnail.enabled && detector.thumbnail.half_width_px == 0 {
        return Err(ContractError::config_validation(
            "detector.thumbnail.half_width_px",
            "thumbnail crop cannot be empty",
        ));
    }
    Ok(())
}

fn validate_liveness(blueprint: &TimingBlueprint) -> Result<(), ContractError> {
    let heartbeat = &blueprint.heartbeat;
    if heartbeat.peer_timeout_ms <= heartbeat.interval_ms {
        return Err(ContractError::config_validation(
            "heartbeat.peer_timeout_ms",
            format!(
                "peer_timeout_ms ({}) must exceed interval_ms ({})",
                heartbeat.peer_timeout_ms, heartbeat.interval_ms
            ),
        ));
    }
    let retry = &blueprint.retry;
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(ContractError::config_validation(
            "retry.max_delay_ms",
            format!(
                "max_delay_ms ({}) must be >= base_delay_ms ({})",
                retry.max_delay_ms, retry.base_delay_ms
            ),
        ));
    }
    if blueprint.clock_sync.min_samples > blueprint.clock_sync.window_size {
        return Err(ContractError::config_validation(
            "clock_sync.min_samples",
            "min_samples cannot exceed window_size",
        ));
    }
    Ok(())
}

fn validate_sinks(blueprint: &TimingBlueprint) -> Result<(), ContractError> {
    let mut names = HashSet::new();
    for (idx, sink) in blueprint.sinks.iter().enumerate() {
        if sink.name.is_empty() {
            return Err(ContractError::config_validation(
                format!("sinks[{idx}].name"),
                "sink name cannot be empty",
            ));
        }
        if !names.insert(sink.name.as_str()) {
            return Err(ContractError::config_validation(
                format!("sinks[name={}]", sink.name),
                "duplicate sink name",
            ));
        }
        if sink.queue_capacity == 0 {
            return Err(ContractError::config_validation(
                format!("sinks[name={}].queue_capacity", sink.name),
                "queue_capacity must be > 0",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{DeviceId, SinkConfig, SinkType};

    fn gate(id: &str, role: GateRole, index: u32, distance_m: f64) -> GateConfig {
        GateConfig {
            id: id.into(),
            role,
            index,
            distance_m,
            device_id: None,
            gate_position: None,
        }
    }

    fn minimal_blueprint() -> TimingBlueprint {
        TimingBlueprint {
            gates: vec![
                gate("start", GateRole::Start, 0, 0.0),
                gate("lap", GateRole::Lap, 1, 15.0),
                gate("finish", GateRole::Finish, 2, 30.0),
            ],
            sinks: vec![SinkConfig {
                name: "log".into(),
                sink_type: SinkType::Log,
                queue_capacity: 16,
                params: Default::default(),
            }],
            ..TimingBlueprint::default()
        }
    }

    fn error_of(bp: &TimingBlueprint) -> String {
        validate(bp).unwrap_err().to_string()
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&minimal_blueprint()).is_ok());
    }

    #[test]
    fn test_duplicate_gate_id() {
        let mut bp = minimal_blueprint();
        bp.gates[1].id = "start".into();
        assert!(error_of(&bp).contains("duplicate gate id"));
    }

    #[test]
    fn test_duplicate_gate_index() {
        let mut bp = minimal_blueprint();
        bp.gates[1].index = 2;
        assert!(error_of(&bp).contains("duplicate gate index"));
    }

    #[test]
    fn test_missing_finish_gate() {
        let mut bp = minimal_blueprint();
        bp.gates.pop();
        let err = error_of(&bp);
        assert!(err.contains("exactly one finish gate, found 0"), "got: {err}");
    }

    #[test]
    fn test_start_must_come_first() {
        let mut bp = minimal_blueprint();
        bp.gates[0].index = 5;
        bp.gates[2].index = 6;
        let err = error_of(&bp);
        assert!(err.contains("lowest index"), "got: {err}");
    }

    #[test]
    fn test_distances_strictly_increase() {
        let mut bp = minimal_blueprint();
        bp.gates[1].distance_m = 30.0;
        let err = error_of(&bp);
        assert!(err.contains("gates[id=finish].distance_m"), "got: {err}");
    }

    #[test]
    fn test_gate_position_range() {
        let mut bp = minimal_blueprint();
        bp.gates[2].gate_position = Some(1.5);
        let err = error_of(&bp);
        assert!(err.contains("gates[id=finish].gate_position"), "got: {err}");
    }

    #[test]
    fn test_nested_detector_field() {
        let mut bp = minimal_blueprint();
        bp.detector.queue.capacity = 0;
        let err = error_of(&bp);
        assert!(err.contains("detector.queue.capacity"), "got: {err}");
    }

    #[test]
    fn test_thresholds_ordered() {
        let mut bp = minimal_blueprint();
        bp.detector.diff_threshold_min = 50.0;
        bp.detector.diff_threshold_max = 20.0;
        assert!(error_of(&bp).contains("diff_threshold_min"));
    }

    #[test]
    fn test_host_cannot_own_gate() {
        let mut bp = minimal_blueprint();
        bp.gates[0].device_id = Some(bp.session.host_id.clone());
        assert!(error_of(&bp).contains("host device"));
    }

    #[test]
    fn test_device_owns_one_gate() {
        let mut bp = minimal_blueprint();
        bp.gates[0].device_id = Some(DeviceId::from("phone-a"));
        bp.gates[2].device_id = Some(DeviceId::from("phone-a"));
        assert!(error_of(&bp).contains("already owns a gate"));
    }

    #[test]
    fn test_peer_timeout_after_interval() {
        let mut bp = minimal_blueprint();
        bp.heartbeat.peer_timeout_ms = bp.heartbeat.interval_ms;
        assert!(error_of(&bp).contains("peer_timeout_ms"));
    }

    #[test]
    fn test_duplicate_sink_name() {
        let mut bp = minimal_blueprint();
        bp.sinks.push(bp.sinks[0].clone());
        assert!(error_of(&bp).contains("duplicate sink name"));
    }

    #[test]
    fn test_zero_queue_capacity() {
        let mut bp = minimal_blueprint();
        bp.sinks[0].queue_capacity = 0;
        assert!(error_of(&bp).contains("queue_capacity must be > 0"));
    }
}

//! Generated courses and device binding.

use contracts::{DeviceId, GateConfig, GateRole, SinkConfig, SinkType, StartType, TimingBlueprint};

/// Evenly spaced course: one start, `gates - 2` laps, one finish.
pub fn generated_course(gates: u32, distance_m: f64, start_type: StartType) -> TimingBlueprint {
    let gates = gates.max(2);
    let mut bp = TimingBlueprint::default();
    bp.session.session_id = "simulation".to_string();
    bp.session.start_type = start_type;
    bp.session.result_timeout_secs = 15.0;
    bp.session.status_interval_ms = 500;
    bp.heartbeat.interval_ms = 500;
    bp.heartbeat.peer_timeout_ms = 3_000;
    bp.gates = (0..gates)
        .map(|i| {
            let (id, role) = match i {
                0 => ("start".to_string(), GateRole::Start),
                i if i == gates - 1 => ("finish".to_string(), GateRole::Finish),
                i => (format!("lap-{i}"), GateRole::Lap),
            };
            GateConfig {
                id,
                role,
                index: i,
                distance_m: distance_m * f64::from(i) / f64::from(gates - 1),
                device_id: None,
                gate_position: None,
            }
        })
        .collect();
    bp.sinks = vec![SinkConfig {
        name: "log".to_string(),
        sink_type: SinkType::Log,
        queue_capacity: 16,
        params: Default::default(),
    }];
    bp
}

/// Bind every unowned timing gate to a simulated device.
///
/// Returns `(device_id, gate index in blueprint)` for each simulated device.
pub fn bind_devices(bp: &mut TimingBlueprint) -> Vec<(DeviceId, usize)> {
    let mut order: Vec<usize> = (0..bp.gates.len())
        .filter(|&i| bp.gates[i].role.is_timing())
        .collect();
    order.sort_by_key(|&i| bp.gates[i].index);

    let mut devices = Vec::with_capacity(order.len());
    for (n, i) in order.into_iter().enumerate() {
        let gate = &mut bp.gates[i];
        let device_id = gate
            .device_id
            .get_or_insert_with(|| DeviceId::new(&format!("gate-{n}")))
            .clone();
        devices.push((device_id, i));
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_course_is_valid() {
        for gates in [2, 3, 6] {
            let bp = generated_course(gates, 40.0, StartType::Flying);
            config_loader::ConfigLoader::validate(&bp).unwrap();
            assert_eq!(bp.gates.len(), gates as usize);
            assert_eq!(bp.total_distance_m(), 40.0);
        }
    }

    #[test]
    fn test_lap_distances_evenly_spaced() {
        let bp = generated_course(5, 40.0, StartType::Flying);
        let distances: Vec<f64> = bp.gates.iter().map(|g| g.distance_m).collect();
        assert_eq!(distances, vec![0.0, 10.0, 20.0, 30.0, 40.0]);
        assert_eq!(bp.gates[2].role, GateRole::Lap);
    }

    #[test]
    fn test_bind_devices_keeps_existing_owner() {
        let mut bp = generated_course(3, 30.0, StartType::Flying);
        bp.gates[2].device_id = Some(DeviceId::from("phone-a"));
        let devices = bind_devices(&mut bp);
        let ids: Vec<&str> = devices.iter().map(|(d, _)| d.as_str()).collect();
        assert_eq!(ids, vec!["gate-0", "gate-1", "phone-a"]);
        assert!(bp.gates.iter().all(|g| g.device_id.is_some()));
        config_loader::ConfigLoader::validate(&bp).unwrap();
    }
}

//! `info` command implementation.

use anyhow::{Context, Result};
use contracts::{DetectorConfig, TimingBlueprint};
use serde::Serialize;
use tracing::info;

use crate::cli::InfoArgs;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    session: SessionInfo,
    gates: Vec<GateInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detector: Option<DetectorInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sinks: Vec<SinkInfo>,
}

#[derive(Serialize)]
struct SessionInfo {
    session_id: String,
    host_id: String,
    start_type: String,
    countdown_seconds: u32,
    result_timeout_secs: f64,
}

#[derive(Serialize)]
struct GateInfo {
    id: String,
    role: String,
    index: u32,
    distance_m: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    gate_position: f64,
}

#[derive(Serialize)]
struct DetectorInfo {
    diff_threshold_min: f32,
    diff_threshold_max: f32,
    min_blob_height_fraction: f32,
    min_velocity_px_per_sec: f32,
    cooldown_secs: f64,
    warmup_frames: u32,
    queue_capacity: usize,
    thumbnails: bool,
}

impl From<&DetectorConfig> for DetectorInfo {
    fn from(d: &DetectorConfig) -> Self {
        Self {
            diff_threshold_min: d.diff_threshold_min,
            diff_threshold_max: d.diff_threshold_max,
            min_blob_height_fraction: d.min_blob_height_fraction,
            min_velocity_px_per_sec: d.min_velocity_px_per_sec,
            cooldown_secs: d.cooldown_secs,
            warmup_frames: d.warmup_frames,
            queue_capacity: d.queue.capacity,
            thumbnails: d.thumbnail.enabled,
        }
    }
}

#[derive(Serialize)]
struct SinkInfo {
    name: String,
    sink_type: String,
    queue_capacity: usize,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    let blueprint = super::load_blueprint(&args.config)?;

    if args.json {
        let info = build_config_info(&blueprint, args);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&blueprint, args);
    }

    Ok(())
}

fn build_config_info(blueprint: &TimingBlueprint, args: &InfoArgs) -> ConfigInfo {
    let session = &blueprint.session;
    let gates = blueprint
        .gate_assignments()
        .into_iter()
        .map(|g| GateInfo {
            gate_position: blueprint.detector_for_gate(&g.gate_id).gate_position,
            id: g.gate_id,
            role: g.role.to_string(),
            index: g.gate_index,
            distance_m: g.distance_meters,
            device_id: g.device_id.map(|d| d.to_string()),
        })
        .collect();

    let sinks = if args.sinks {
        blueprint
            .sinks
            .iter()
            .map(|s| SinkInfo {
                name: s.name.clone(),
                sink_type: format!("{:?}", s.sink_type),
                queue_capacity: s.queue_capacity,
            })
            .collect()
    } else {
        Vec::new()
    };

    ConfigInfo {
        version: format!("{:?}", blueprint.version),
        session: SessionInfo {
            session_id: session.session_id.clone(),
            host_id: session.host_id.to_string(),
            start_type: format!("{:?}", session.start_type),
            countdown_seconds: session.countdown_seconds,
            result_timeout_secs: session.result_timeout_secs,
        },
        gates,
        detector: args.detector.then(|| DetectorInfo::from(&blueprint.detector)),
        sinks,
    }
}

fn print_config_info(blueprint: &TimingBlueprint, args: &InfoArgs) {
    let session = &blueprint.session;
    println!("=== Sprint Timer Configuration ===\n");

    println!("Session");
    println!("   ├─ Version: {:?}", blueprint.version);
    println!("   ├─ Id: {}", session.session_id);
    println!("   ├─ Host: {}", session.host_id);
    println!("   ├─ Start type: {:?}", session.start_type);
    println!("   ├─ Countdown: {}s", session.countdown_seconds);
    println!("   └─ Result timeout: {}s", session.result_timeout_secs);

    let gates = blueprint.gate_assignments();
    println!("\nGates ({}, {} m)", gates.len(), blueprint.total_distance_m());
    for (i, gate) in gates.iter().enumerate() {
        let prefix = if i == gates.len() - 1 { "└─" } else { "├─" };
        let device = gate
            .device_id
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "unassigned".to_string());
        println!(
            "   {} #{} {} ({}) at {} m - {}",
            prefix, gate.gate_index, gate.gate_id, gate.role, gate.distance_meters, device
        );
    }

    if args.detector {
        let d = &blueprint.detector;
        println!("\nDetector");
        println!("   ├─ Gate line: {}", d.gate_position);
        println!(
            "   ├─ Diff threshold: {} .. {}",
            d.diff_threshold_min, d.diff_threshold_max
        );
        println!("   ├─ Min blob height: {}", d.min_blob_height_fraction);
        println!("   ├─ Min velocity: {} px/s", d.min_velocity_px_per_sec);
        println!("   ├─ Cooldown: {}s", d.cooldown_secs);
        println!("   ├─ Warmup: {} frames", d.warmup_frames);
        println!(
            "   └─ Frame queue: {} ({:?})",
            d.queue.capacity, d.queue.drop_policy
        );
    }

    if args.sinks && !blueprint.sinks.is_empty() {
        println!("\nSinks ({})", blueprint.sinks.len());
        for (i, sink) in blueprint.sinks.iter().enumerate() {
            let is_last = i == blueprint.sinks.len() - 1;
            let prefix = if is_last { "└─" } else { "├─" };
            println!("   {} {} ({:?})", prefix, sink.name, sink.sink_type);
        }
    }

    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::generated_course;
    use contracts::StartType;
    use std::path::PathBuf;

    #[test]
    fn test_info_orders_gates_and_skips_optional_sections() {
        let mut bp = generated_course(3, 30.0, StartType::Countdown);
        bp.gates.reverse();
        let args = InfoArgs {
            config: PathBuf::from("unused.toml"),
            json: true,
            detector: false,
            sinks: false,
        };
        let info = build_config_info(&bp, &args);
        let ids: Vec<&str> = info.gates.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["start", "lap-1", "finish"]);

        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("detector").is_none());
        assert!(json.get("sinks").is_none());
        assert_eq!(json["session"]["start_type"], "Countdown");
    }
}

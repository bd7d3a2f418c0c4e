//! Split computation on the host timeline

use std::collections::HashMap;

use contracts::{GateAssignment, GateRole, SegmentSplit};

use crate::CoordinatorError;

/// A crossing already projected onto the host clock.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedCrossing {
    pub gate_id: String,
    pub host_nanos: i64,
    pub uncertainty_ms: f64,
    pub synced: bool,
}

/// Result of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOutcome {
    pub start_gate_id: String,
    pub finish_gate_id: String,
    pub total_split_nanos: i64,
    pub total_distance_meters: f64,
    pub segments: Vec<SegmentSplit>,
    pub uncertainty_ms: f64,
    pub synced: bool,
}

/// Compute cumulative splits from start through every lap gate that fired to finish.
///
/// `start_override` replaces the start-gate crossing for countdown and manual
/// starts. Lap gates without a crossing are skipped; their distance folds into
/// the next segment. Every segment must have a positive split.
pub fn compute_splits(
    run_id: &str,
    gates: &[GateAssignment],
    crossings: &HashMap<String, ProjectedCrossing>,
    start_override: Option<&ProjectedCrossing>,
) -> Result<SplitOutcome, CoordinatorError> {
    let mut timing: Vec<&GateAssignment> = gates.iter().filter(|g| g.role.is_timing()).collect();
    timing.sort_by_key(|g| g.gate_index);

    let start_gate = *timing
        .iter()
        .find(|g| g.role == GateRole::Start)
        .ok_or(CoordinatorError::MissingRole { role: "start" })?;
    let finish_gate = *timing
        .iter()
        .find(|g| g.role == GateRole::Finish)
        .ok_or(CoordinatorError::MissingRole { role: "finish" })?;

    let start = start_override
        .or_else(|| crossings.get(&start_gate.gate_id))
        .ok_or_else(|| CoordinatorError::IncompleteRun {
            run_id: run_id.to_string(),
            gate_id: start_gate.gate_id.clone(),
        })?;
    let finish =
        crossings
            .get(&finish_gate.gate_id)
            .ok_or_else(|| CoordinatorError::IncompleteRun {
                run_id: run_id.to_string(),
                gate_id: finish_gate.gate_id.clone(),
            })?;

    let mut chain: Vec<(&GateAssignment, &ProjectedCrossing)> = vec![(start_gate, start)];
    chain.extend(timing.iter().filter(|g| g.role == GateRole::Lap).filter_map(|g| {
        crossings.get(&g.gate_id).map(|c| (*g, c))
    }));
    chain.push((finish_gate, finish));

    if let Some(pair) = chain.windows(2).find(|p| p[1].1.host_nanos <= p[0].1.host_nanos) {
        return Err(CoordinatorError::OutOfOrderCrossing {
            run_id: run_id.to_string(),
            gate_id: pair[1].0.gate_id.clone(),
        });
    }

    let segments: Vec<SegmentSplit> = chain
        .windows(2)
        .map(|pair| {
            let (from_gate, from) = pair[0];
            let (to_gate, to) = pair[1];
            let split_nanos = to.host_nanos - from.host_nanos;
            let distance_meters = to_gate.distance_meters - from_gate.distance_meters;
            SegmentSplit {
                from_gate_id: from_gate.gate_id.clone(),
                to_gate_id: to_gate.gate_id.clone(),
                from_index: from_gate.gate_index,
                to_index: to_gate.gate_index,
                distance_meters,
                split_nanos,
                cumulative_nanos: to.host_nanos - start.host_nanos,
                cumulative_distance_meters: to_gate.distance_meters - start_gate.distance_meters,
                speed_mps: speed(distance_meters, split_nanos),
                uncertainty_ms: from.uncertainty_ms + to.uncertainty_ms,
            }
        })
        .collect();

    Ok(SplitOutcome {
        start_gate_id: start_gate.gate_id.clone(),
        finish_gate_id: finish_gate.gate_id.clone(),
        total_split_nanos: finish.host_nanos - start.host_nanos,
        total_distance_meters: finish_gate.distance_meters - start_gate.distance_meters,
        segments,
        uncertainty_ms: start.uncertainty_ms + finish.uncertainty_ms,
        synced: chain.iter().all(|(_, c)| c.synced),
    })
}

fn speed(distance_meters: f64, split_nanos: i64) -> f64 {
    if split_nanos <= 0 {
        return 0.0;
    }
    distance_meters / (split_nanos as f64 / 1e9)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(id: &str, role: GateRole, index: u32, distance: f64) -> GateAssignment {
        GateAssignment {
            gate_id: id.into(),
            role,
            gate_index: index,
            distance_meters: distance,
            device_id: None,
        }
    }

    fn course() -> Vec<GateAssignment> {
        vec![
            gate("finish", GateRole::Finish, 2, 40.0),
            gate("start", GateRole::Start, 0, 0.0),
            gate("lap10", GateRole::Lap, 1, 10.0),
            gate("tablet", GateRole::Control, 3, 0.0),
        ]
    }

    fn crossing(gate: &str, at: i64, u: f64) -> (String, ProjectedCrossing) {
        (
            gate.to_string(),
            ProjectedCrossing {
                gate_id: gate.into(),
                host_nanos: at,
                uncertainty_ms: u,
                synced: true,
            },
        )
    }

    #[test]
    fn test_three_gate_splits() {
        let crossings: HashMap<_, _> = [
            crossing("start", 1_000_000_000, 0.5),
            crossing("lap10", 2_800_000_000, 1.0),
            crossing("finish", 5_800_000_000, 1.5),
        ]
        .into_iter()
        .collect();

        let out = compute_splits("r1", &course(), &crossings, None).unwrap();
        assert_eq!(out.total_split_nanos, 4_800_000_000);
        assert_eq!(out.total_distance_meters, 40.0);
        assert_eq!(out.segments.len(), 2);

        let first = &out.segments[0];
        assert_eq!(first.from_gate_id, "start");
        assert_eq!(first.to_gate_id, "lap10");
        assert_eq!(first.split_nanos, 1_800_000_000);
        assert_eq!(first.cumulative_nanos, 1_800_000_000);
        assert!((first.speed_mps - 10.0 / 1.8).abs() < 1e-9);
        assert_eq!(first.uncertainty_ms, 1.5);

        let second = &out.segments[1];
        assert_eq!(second.split_nanos, 3_000_000_000);
        assert_eq!(second.cumulative_nanos, 4_800_000_000);
        assert_eq!(second.cumulative_distance_meters, 40.0);
        assert!((second.speed_mps - 10.0).abs() < 1e-9);
        assert_eq!(out.uncertainty_ms, 2.0);
        assert!(out.synced);
    }

    #[test]
    fn test_missing_lap_folds_into_next_segment() {
        let crossings: HashMap<_, _> = [
            crossing("start", 0, 0.0),
            crossing("finish", 5_000_000_000, 0.0),
        ]
        .into_iter()
        .collect();

        let out = compute_splits("r1", &course(), &crossings, None).unwrap();
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].distance_meters, 40.0);
        assert!((out.segments[0].speed_mps - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_start_override() {
        let crossings: HashMap<_, _> = [crossing("finish", 4_000_000_000, 1.0)].into_iter().collect();
        let signal = ProjectedCrossing {
            gate_id: "start".into(),
            host_nanos: 0,
            uncertainty_ms: 0.0,
            synced: true,
        };
        let out = compute_splits("r1", &course(), &crossings, Some(&signal)).unwrap();
        assert_eq!(out.total_split_nanos, 4_000_000_000);
        assert_eq!(out.uncertainty_ms, 1.0);
    }

    #[test]
    fn test_missing_finish_is_incomplete() {
        let crossings: HashMap<_, _> = [crossing("start", 0, 0.0)].into_iter().collect();
        let err = compute_splits("r7", &course(), &crossings, None).unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::IncompleteRun {
                run_id: "r7".into(),
                gate_id: "finish".into()
            }
        );
    }

    #[test]
    fn test_finish_before_start_is_rejected() {
        let crossings: HashMap<_, _> = [
            crossing("start", 2_000_000_000, 0.0),
            crossing("finish", 1_000_000_000, 0.0),
        ]
        .into_iter()
        .collect();
        let err = compute_splits("r3", &course(), &crossings, None).unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::OutOfOrderCrossing {
                run_id: "r3".into(),
                gate_id: "finish".into()
            }
        );
    }

    #[test]
    fn test_lap_after_finish_is_rejected() {
        let crossings: HashMap<_, _> = [
            crossing("start", 0, 0.0),
            crossing("lap10", 5_000_000_000, 0.0),
            crossing("finish", 4_000_000_000, 0.0),
        ]
        .into_iter()
        .collect();
        let err = compute_splits("r1", &course(), &crossings, None).unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::OutOfOrderCrossing {
                run_id: "r1".into(),
                gate_id: "finish".into()
            }
        );

        let same_instant: HashMap<_, _> = [crossing("start", 0, 0.0), crossing("finish", 0, 0.0)]
            .into_iter()
            .collect();
        assert!(compute_splits("r1", &course(), &same_instant, None).is_err());
    }

    #[test]
    fn test_unsynced_gate_flags_result() {
        let mut crossings: HashMap<_, _> = [
            crossing("start", 0, 0.0),
            crossing("finish", 4_000_000_000, 50.0),
        ]
        .into_iter()
        .collect();
        if let Some(c) = crossings.get_mut("finish") {
            c.synced = false;
        }
        let out = compute_splits("r1", &course(), &crossings, None).unwrap();
        assert!(!out.synced);
        assert_eq!(out.uncertainty_ms, 50.0);
    }
}

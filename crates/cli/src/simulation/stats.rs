//! Simulation results and metrics.

use std::time::Duration;

use contracts::RunRecord;
use observability::TimingMetricsAggregator;

/// One timed sprint against the scripted truth.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub record: RunRecord,
    /// Split the script implies (s)
    pub expected_seconds: f64,
}

impl RunOutcome {
    pub fn error_ms(&self) -> f64 {
        (self.record.total_seconds() - self.expected_seconds) * 1e3
    }
}

/// Host clock estimate of one device against its true offset.
#[derive(Debug, Clone)]
pub struct ClockOutcome {
    pub device_id: String,
    pub true_offset_ms: f64,
    pub estimated_offset_ms: Option<f64>,
    pub uncertainty_ms: Option<f64>,
}

/// Statistics from a simulation run
#[derive(Debug, Clone, Default)]
pub struct SimulationStats {
    pub runs: Vec<RunOutcome>,
    pub runs_cancelled: u32,
    pub clocks: Vec<ClockOutcome>,
    pub network_dropped: u64,
    pub network_duplicated: u64,
    pub duration: Duration,
    pub metrics: TimingMetricsAggregator,
}

impl SimulationStats {
    /// Largest timing error over the completed runs (ms)
    pub fn max_error_ms(&self) -> f64 {
        self.runs
            .iter()
            .map(|r| r.error_ms().abs())
            .fold(0.0, f64::max)
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n=== Simulation ===\n");
        println!("Duration: {:.2}s", self.duration.as_secs_f64());
        println!(
            "Network: {} datagrams lost, {} duplicated",
            self.network_dropped, self.network_duplicated
        );

        println!("\nRuns ({} completed, {} cancelled)", self.runs.len(), self.runs_cancelled);
        for run in &self.runs {
            let record = &run.record;
            println!(
                "  {}  {:.3}s (expected {:.3}s, error {:+.1} ms, ±{:.1} ms){}",
                record.run_id,
                record.total_seconds(),
                run.expected_seconds,
                run.error_ms(),
                record.uncertainty_ms,
                if record.synced { "" } else { "  [unsynced]" }
            );
            for segment in &record.segments {
                println!(
                    "    {} -> {}: {:.3}s  {:.2} m/s",
                    segment.from_gate_id,
                    segment.to_gate_id,
                    segment.split_nanos as f64 / 1e9,
                    segment.speed_mps
                );
            }
        }

        if !self.clocks.is_empty() {
            println!("\nClock offsets");
            for clock in &self.clocks {
                match (clock.estimated_offset_ms, clock.uncertainty_ms) {
                    (Some(estimate), Some(uncertainty)) => println!(
                        "  {}: true {:+.2} ms, estimated {:+.2} ms (±{:.2} ms)",
                        clock.device_id, clock.true_offset_ms, estimate, uncertainty
                    ),
                    _ => println!(
                        "  {}: true {:+.2} ms, no estimate",
                        clock.device_id, clock.true_offset_ms
                    ),
                }
            }
        }

        println!("\n{}", self.metrics.summary());
    }
}

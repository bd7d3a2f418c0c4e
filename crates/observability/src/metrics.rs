//! Timing metric descriptions and session summaries

use std::collections::BTreeMap;
use std::fmt;

use contracts::RunRecord;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// Register help text for every metric the timing crates emit.
pub fn describe_timing_metrics() {
    describe_counter!("timing_frames_processed_total", "Camera frames run through a detector");
    describe_counter!("timing_frames_dropped_total", "Frames dropped by a full frame queue");
    describe_counter!("timing_crossings_total", "Gate crossings emitted per gate");
    describe_gauge!("timing_detector_phase", "Detector state machine phase per gate");
    describe_gauge!(
        "timing_clock_offset_ms",
        Unit::Milliseconds,
        "Estimated peer clock offset"
    );
    describe_gauge!(
        "timing_clock_uncertainty_ms",
        Unit::Milliseconds,
        "Half round-trip of the best clock sample"
    );
    describe_counter!(
        "timing_clock_samples_rejected_total",
        "Clock samples above the round-trip ceiling"
    );
    describe_counter!("timing_messages_sent_total", "Envelopes sent per payload case");
    describe_counter!("timing_messages_retried_total", "Retransmissions of unacked envelopes");
    describe_counter!("timing_delivery_failures_total", "Envelopes abandoned after the last retry");
    describe_counter!("timing_duplicates_dropped_total", "Inbound duplicates discarded");
    describe_counter!("timing_runs_completed_total", "Runs with a published result");
    describe_histogram!("timing_split_seconds", Unit::Seconds, "Total split per completed run");
}

/// In-memory roll-up of a timing session
///
/// Fed by the simulation loop; renders a text report with `Display`.
#[derive(Debug, Clone, Default)]
pub struct TimingMetricsAggregator {
    pub runs_completed: u64,
    pub runs_unsynced: u64,
    pub runs_cancelled: u64,
    pub split_seconds: RunningStats,
    pub result_uncertainty_ms: RunningStats,
    pub crossings: BTreeMap<String, u64>,
    pub clock_uncertainty_ms: BTreeMap<String, RunningStats>,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub messages_sent: u64,
    pub messages_retried: u64,
    pub delivery_failures: u64,
    pub duplicates_dropped: u64,
}

impl TimingMetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&mut self, record: &RunRecord) {
        self.runs_completed += 1;
        if !record.synced {
            self.runs_unsynced += 1;
        }
        self.split_seconds.push(record.total_seconds());
        self.result_uncertainty_ms.push(record.uncertainty_ms);
    }

    pub fn record_cancelled(&mut self) {
        self.runs_cancelled += 1;
    }

    pub fn record_crossing(&mut self, gate_id: &str) {
        *self.crossings.entry(gate_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_clock_uncertainty(&mut self, peer: &str, uncertainty_ms: f64) {
        self.clock_uncertainty_ms
            .entry(peer.to_string())
            .or_default()
            .push(uncertainty_ms);
    }

    /// Add one detector pipeline's frame counters.
    pub fn add_frames(&mut self, processed: u64, dropped: u64) {
        self.frames_processed += processed;
        self.frames_dropped += dropped;
    }

    /// Add one transport's delivery counters.
    pub fn add_transport(&mut self, sent: u64, retried: u64, failures: u64, duplicates: u64) {
        self.messages_sent += sent;
        self.messages_retried += retried;
        self.delivery_failures += failures;
        self.duplicates_dropped += duplicates;
    }

    pub fn summary(&self) -> TimingMetricsSummary {
        TimingMetricsSummary {
            runs_completed: self.runs_completed,
            runs_unsynced: self.runs_unsynced,
            runs_cancelled: self.runs_cancelled,
            split_seconds: StatsSummary::from(&self.split_seconds),
            result_uncertainty_ms: StatsSummary::from(&self.result_uncertainty_ms),
            crossings: self.crossings.clone(),
            clock_uncertainty_ms: self
                .clock_uncertainty_ms
                .iter()
                .map(|(peer, stats)| (peer.clone(), StatsSummary::from(stats)))
                .collect(),
            frames_processed: self.frames_processed,
            frame_drop_rate: percent(self.frames_dropped, self.frames_processed + self.frames_dropped),
            messages_sent: self.messages_sent,
            retry_rate: percent(self.messages_retried, self.messages_sent),
            delivery_failures: self.delivery_failures,
            duplicates_dropped: self.duplicates_dropped,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimingMetricsSummary {
    pub runs_completed: u64,
    pub runs_unsynced: u64,
    pub runs_cancelled: u64,
    pub split_seconds: StatsSummary,
    pub result_uncertainty_ms: StatsSummary,
    pub crossings: BTreeMap<String, u64>,
    pub clock_uncertainty_ms: BTreeMap<String, StatsSummary>,
    pub frames_processed: u64,
    pub frame_drop_rate: f64,
    pub messages_sent: u64,
    pub retry_rate: f64,
    pub delivery_failures: u64,
    pub duplicates_dropped: u64,
}

impl fmt::Display for TimingMetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Timing Summary ===")?;
        writeln!(
            f,
            "Runs: {} completed ({} unsynced), {} cancelled",
            self.runs_completed, self.runs_unsynced, self.runs_cancelled
        )?;
        writeln!(f, "Split (s): {}", self.split_seconds)?;
        writeln!(f, "Result uncertainty (ms): {}", self.result_uncertainty_ms)?;

        if !self.crossings.is_empty() {
            writeln!(f, "Crossings:")?;
            for (gate, count) in &self.crossings {
                writeln!(f, "  {gate}: {count}")?;
            }
        }
        if !self.clock_uncertainty_ms.is_empty() {
            writeln!(f, "Clock uncertainty (ms):")?;
            for (peer, stats) in &self.clock_uncertainty_ms {
                writeln!(f, "  {peer}: {stats}")?;
            }
        }

        writeln!(
            f,
            "Frames: {} processed ({:.2}% dropped)",
            self.frames_processed, self.frame_drop_rate
        )?;
        writeln!(
            f,
            "Messages: {} sent ({:.2}% retried), {} failed, {} duplicates dropped",
            self.messages_sent, self.retry_rate, self.delivery_failures, self.duplicates_dropped
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// Online mean and variance (Welford)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (value - self.mean);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::StartType;

    fn run(run_id: &str, split_nanos: i64, synced: bool) -> RunRecord {
        RunRecord {
            session_id: "s1".into(),
            run_id: run_id.into(),
            completed_at_unix_ms: 0,
            start_type: StartType::Flying,
            total_split_nanos: split_nanos,
            total_distance_meters: 30.0,
            segments: Vec::new(),
            uncertainty_ms: 2.0,
            synced,
        }
    }

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            stats.push(v);
        }

        assert_eq!(stats.count(), 5);
        assert!((stats.mean() - 3.0).abs() < 1e-10);
        assert!((stats.min() - 1.0).abs() < 1e-10);
        assert!((stats.max() - 5.0).abs() < 1e-10);
        assert!((stats.variance() - 2.5).abs() < 1e-10);
    }

    #[test]
    fn test_aggregator_runs() {
        let mut aggregator = TimingMetricsAggregator::new();
        aggregator.record_run(&run("r1", 4_000_000_000, true));
        aggregator.record_run(&run("r2", 5_000_000_000, false));
        aggregator.record_cancelled();
        aggregator.record_crossing("finish");
        aggregator.record_crossing("finish");
        aggregator.add_transport(200, 10, 1, 3);

        let summary = aggregator.summary();
        assert_eq!(summary.runs_completed, 2);
        assert_eq!(summary.runs_unsynced, 1);
        assert_eq!(summary.runs_cancelled, 1);
        assert!((summary.split_seconds.mean - 4.5).abs() < 1e-9);
        assert_eq!(summary.crossings.get("finish"), Some(&2));
        assert!((summary.retry_rate - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_display() {
        let mut aggregator = TimingMetricsAggregator::new();
        aggregator.record_run(&run("r1", 4_210_000_000, true));
        aggregator.record_clock_uncertainty("gate-a", 1.25);
        aggregator.add_frames(90, 10);

        let output = aggregator.summary().to_string();
        assert!(output.contains("Runs: 1 completed (0 unsynced), 0 cancelled"));
        assert!(output.contains("mean=4.210"));
        assert!(output.contains("gate-a: min=1.250"));
        assert!(output.contains("10.00% dropped"));
    }

    #[test]
    fn test_empty_stats_display() {
        assert_eq!(StatsSummary::default().to_string(), "N/A");
    }
}

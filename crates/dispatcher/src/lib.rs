//! # Dispatcher
//!
//! Result dispatch.
//!
//! - Consumes completed `RunRecord`s
//! - Fans them out to every configured result sink
//! - Isolates slow sinks so a stuck writer never stalls the session

pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod sinks;

pub use contracts::{ResultSink, RunRecord};
pub use dispatcher::{create_dispatcher, Dispatcher, DispatcherBuilder, DispatcherConfig};
pub use error::DispatcherError;
pub use handle::SinkHandle;
pub use metrics::{MetricsSnapshot, SinkMetrics};
pub use sinks::{FileSink, FileSinkConfig, LogSink};

#[cfg(test)]
pub(crate) mod test_support {
    use contracts::{RunRecord, SegmentSplit, StartType};

    pub fn record(run_id: &str) -> RunRecord {
        RunRecord {
            session_id: "s1".into(),
            run_id: run_id.into(),
            completed_at_unix_ms: 1_760_400_000_000,
            start_type: StartType::Flying,
            total_split_nanos: 4_210_000_000,
            total_distance_meters: 30.0,
            segments: vec![SegmentSplit {
                from_gate_id: "start".into(),
                to_gate_id: "finish".into(),
                from_index: 0,
                to_index: 1,
                distance_meters: 30.0,
                split_nanos: 4_210_000_000,
                cumulative_nanos: 4_210_000_000,
                cumulative_distance_meters: 30.0,
                speed_mps: 30.0 / 4.21,
                uncertainty_ms: 1.5,
            }],
            uncertainty_ms: 1.5,
            synced: true,
        }
    }
}

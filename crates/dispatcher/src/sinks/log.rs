//! LogSink - reports each completed run through tracing

use contracts::{ContractError, ResultSink, RunRecord};
use tracing::{info, instrument};

/// Sink that logs a run summary and its segments
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn log_run_summary(&self, record: &RunRecord) {
        info!(
            sink = %self.name,
            session_id = %record.session_id,
            run_id = %record.run_id,
            start_type = ?record.start_type,
            total_seconds = record.total_seconds(),
            distance_m = record.total_distance_meters,
            uncertainty_ms = record.uncertainty_ms,
            synced = record.synced,
            "run completed"
        );
        for segment in &record.segments {
            info!(
                sink = %self.name,
                run_id = %record.run_id,
                from = %segment.from_gate_id,
                to = %segment.to_gate_id,
                split_seconds = segment.split_nanos as f64 / 1e9,
                speed_mps = segment.speed_mps,
                "segment"
            );
        }
    }
}

impl ResultSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "log_sink_write",
        skip(self, record),
        fields(sink = %self.name, run_id = %record.run_id)
    )]
    async fn write(&mut self, record: &RunRecord) -> Result<(), ContractError> {
        self.log_run_summary(record);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ContractError> {
        Ok(())
    }

    #[instrument(name = "log_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), ContractError> {
        info!(sink = %self.name, "LogSink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::record;

    #[tokio::test]
    async fn test_log_sink_write() {
        let mut sink = LogSink::new("test_log");
        assert!(sink.write(&record("s1-run1")).await.is_ok());
        assert_eq!(sink.name(), "test_log");
    }
}

//! Detector pipeline errors

use thiserror::Error;

/// Pipeline wiring errors. Frame-level problems never surface here.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// Frame queue closed
    #[error("frame queue for gate '{gate_id}' is closed")]
    QueueClosed { gate_id: String },

    /// Control channel closed
    #[error("control channel for gate '{gate_id}' is closed")]
    ControlClosed { gate_id: String },

    /// Worker thread could not be spawned
    #[error("failed to spawn detector worker for gate '{gate_id}': {source}")]
    WorkerSpawn {
        gate_id: String,
        #[source]
        source: std::io::Error,
    },
}

//! Coordinator errors

use thiserror::Error;

use crate::SessionPhase;

#[derive(Debug, Error, PartialEq)]
pub enum CoordinatorError {
    /// Operation not allowed in the current phase
    #[error("cannot {operation} while {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: SessionPhase,
    },

    /// Gates that cannot take part in a run yet
    #[error("gates not ready: {}", gates.join(", "))]
    GatesNotReady { gates: Vec<String> },

    #[error("unknown gate '{gate_id}'")]
    UnknownGate { gate_id: String },

    #[error("no active run")]
    NoActiveRun,

    /// A run lacks the crossings needed for a result
    #[error("run '{run_id}' is missing a crossing at gate '{gate_id}'")]
    IncompleteRun { run_id: String, gate_id: String },

    /// Crossings out of course order on the host timeline
    #[error("run '{run_id}' has a non-positive split into gate '{gate_id}'")]
    OutOfOrderCrossing { run_id: String, gate_id: String },

    #[error("blueprint has no {role} gate")]
    MissingRole { role: &'static str },

    /// Driver task is gone
    #[error("session driver closed")]
    DriverClosed,
}

impl CoordinatorError {
    pub fn invalid_phase(operation: &'static str, phase: SessionPhase) -> Self {
        Self::InvalidPhase { operation, phase }
    }
}

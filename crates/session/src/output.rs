//! Side effects requested by the coordinators

use contracts::{DeviceId, RunRecord};
use crossing_detector::DetectorCommand;
use protocol::TimingMessage;

/// Work a coordinator hands back to its driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Send {
        to: Vec<DeviceId>,
        message: TimingMessage,
    },
    /// Command for the local detector pipeline
    Detector(DetectorCommand),
    /// Drop pending retries of a run
    CancelRetries { run_id: String },
    RunCompleted(RunRecord),
}

impl Output {
    pub fn send_to(to: &DeviceId, message: TimingMessage) -> Self {
        Output::Send {
            to: vec![to.clone()],
            message,
        }
    }
}

//! ResultSink trait - persisted result output interface

use crate::{ContractError, RunRecord};

/// Storage collaborator for completed runs.
///
/// All sink implementations must implement this trait.
#[trait_variant::make(ResultSink: Send)]
pub trait LocalResultSink {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Persist one completed run
    ///
    /// # Errors
    /// Returns write error (should include context)
    async fn write(&mut self, record: &RunRecord) -> Result<(), ContractError>;

    /// Flush buffer (if any)
    async fn flush(&mut self) -> Result<(), ContractError>;

    /// Close sink
    async fn close(&mut self) -> Result<(), ContractError>;
}

//! Clock sync errors

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockSyncError {
    /// Pong for a ping we never sent or already expired
    #[error("unknown ping id '{ping_id}'")]
    UnknownPing { ping_id: String },

    /// Pong answered on behalf of another requester
    #[error("pong for requester '{requester_id}' received by '{local_id}'")]
    WrongRequester {
        requester_id: String,
        local_id: String,
    },

    /// Pong arrived from a different peer than the ping was sent to
    #[error("ping '{ping_id}' was sent to '{expected}', answered by '{actual}'")]
    PeerMismatch {
        ping_id: String,
        expected: String,
        actual: String,
    },
}

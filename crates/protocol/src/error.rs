//! Wire protocol errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload key not in the catalogue
    #[error("unknown payload case '{case}'")]
    UnknownCase { case: String },

    /// Peer speaks another protocol version
    #[error("protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u64 },

    /// Structurally invalid envelope
    #[error("malformed message: {message}")]
    Malformed { message: String },

    /// JSON (de)serialization failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

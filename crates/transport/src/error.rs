//! Transport errors

use contracts::DeviceId;
use protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// No route to the peer
    #[error("peer '{peer}' is unreachable")]
    PeerUnreachable { peer: DeviceId },

    /// Worker or link already shut down
    #[error("transport closed")]
    Closed,

    #[error("encode failed: {0}")]
    Encode(#[from] ProtocolError),
}

impl TransportError {
    pub fn unreachable(peer: &DeviceId) -> Self {
        Self::PeerUnreachable { peer: peer.clone() }
    }
}

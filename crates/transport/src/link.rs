//! Peer link abstraction

use bytes::Bytes;
use contracts::DeviceId;

use crate::TransportError;

/// Raw bytes received from a peer.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: DeviceId,
    pub bytes: Bytes,
}

/// Best-effort datagram link to the other devices of a session.
///
/// Inbound datagrams are delivered on a channel handed out with the link.
#[trait_variant::make(PeerTransport: Send)]
pub trait LocalPeerTransport {
    fn local_id(&self) -> &DeviceId;

    async fn send(&self, to: &DeviceId, bytes: Bytes) -> Result<(), TransportError>;
}

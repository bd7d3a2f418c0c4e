//! In-process lossy network
//!
//! Every joined device gets an unbounded inbox. Loss and duplication are
//! driven by a seeded RNG so simulations are reproducible.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use contracts::DeviceId;

use crate::{Datagram, PeerTransport, TransportError};

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkConditions {
    /// Probability a datagram is lost
    pub drop_rate: f64,
    /// Probability a delivered datagram arrives twice
    pub duplicate_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
}

struct NetworkInner {
    inboxes: HashMap<DeviceId, mpsc::UnboundedSender<Datagram>>,
    offline: HashSet<DeviceId>,
    conditions: NetworkConditions,
    rng: StdRng,
    stats: NetworkStats,
}

#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new(conditions: NetworkConditions, seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                inboxes: HashMap::new(),
                offline: HashSet::new(),
                conditions,
                rng: StdRng::seed_from_u64(seed),
                stats: NetworkStats::default(),
            })),
        }
    }

    /// Lossless network.
    pub fn reliable() -> Self {
        Self::new(NetworkConditions::default(), 0)
    }

    /// Register a device and return its link plus inbox.
    pub fn join(&self, id: impl Into<DeviceId>) -> (MemoryLink, mpsc::UnboundedReceiver<Datagram>) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(id.clone(), tx);
        debug!(device = %id, "joined memory network");
        (
            MemoryLink {
                id,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Take a device off the network; traffic to and from it is lost.
    pub fn set_offline(&self, id: &DeviceId, offline: bool) {
        let mut inner = self.lock();
        if offline {
            inner.offline.insert(id.clone());
        } else {
            inner.offline.remove(id);
        }
    }

    pub fn set_conditions(&self, conditions: NetworkConditions) {
        self.lock().conditions = conditions;
    }

    pub fn stats(&self) -> NetworkStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, from: &DeviceId, to: &DeviceId, bytes: Bytes) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let inbox = inner
            .inboxes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::unreachable(to))?;

        if inner.offline.contains(from) || inner.offline.contains(to) {
            inner.stats.dropped += 1;
            trace!(from = %from, to = %to, "link down, datagram lost");
            return Ok(());
        }

        let NetworkConditions {
            drop_rate,
            duplicate_rate,
        } = inner.conditions;
        if inner.rng.random_bool(drop_rate.clamp(0.0, 1.0)) {
            inner.stats.dropped += 1;
            trace!(from = %from, to = %to, "datagram dropped");
            return Ok(());
        }
        let copies = if inner.rng.random_bool(duplicate_rate.clamp(0.0, 1.0)) {
            inner.stats.duplicated += 1;
            2
        } else {
            1
        };

        for _ in 0..copies {
            let datagram = Datagram {
                from: from.clone(),
                bytes: bytes.clone(),
            };
            if inbox.send(datagram).is_err() {
                return Err(TransportError::unreachable(to));
            }
        }
        inner.stats.delivered += 1;
        Ok(())
    }
}

/// One device's endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryLink {
    id: DeviceId,
    network: MemoryNetwork,
}

impl PeerTransport for MemoryLink {
    fn local_id(&self) -> &DeviceId {
        &self.id
    }

    async fn send(&self, to: &DeviceId, bytes: Bytes) -> Result<(), TransportError> {
        self.network.deliver(&self.id, to, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reliable_delivery() {
        let net = MemoryNetwork::reliable();
        let (a, _a_rx) = net.join("a");
        let (_b, mut b_rx) = net.join("b");

        a.send(&DeviceId::from("b"), Bytes::from_static(b"hi"))
            .await
            .unwrap();
        let got = b_rx.recv().await.unwrap();
        assert_eq!(got.from, "a");
        assert_eq!(&got.bytes[..], b"hi");
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let net = MemoryNetwork::reliable();
        let (a, _rx) = net.join("a");
        let err = a
            .send(&DeviceId::from("ghost"), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PeerUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_offline_peer_loses_traffic() {
        let net = MemoryNetwork::reliable();
        let (a, _a_rx) = net.join("a");
        let (_b, mut b_rx) = net.join("b");
        let b = DeviceId::from("b");

        net.set_offline(&b, true);
        a.send(&b, Bytes::from_static(b"x")).await.unwrap();
        assert!(b_rx.try_recv().is_err());
        assert_eq!(net.stats().dropped, 1);

        net.set_offline(&b, false);
        a.send(&b, Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(&b_rx.try_recv().unwrap().bytes[..], b"y");
    }

    #[tokio::test]
    async fn test_seeded_loss_is_reproducible() {
        let run = || async {
            let net = MemoryNetwork::new(
                NetworkConditions {
                    drop_rate: 0.3,
                    duplicate_rate: 0.2,
                },
                7,
            );
            let (a, _a_rx) = net.join("a");
            let (_b, _b_rx) = net.join("b");
            for _ in 0..200 {
                a.send(&DeviceId::from("b"), Bytes::new()).await.unwrap();
            }
            net.stats()
        };
        let first = run().await;
        let second = run().await;
        assert_eq!(first, second);
        assert!(first.dropped > 0);
        assert!(first.duplicated > 0);
        assert_eq!(first.dropped + first.delivered, 200);
    }
}

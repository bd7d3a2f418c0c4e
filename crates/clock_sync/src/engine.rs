//! ClockSyncEngine - ping/pong bookkeeping and per-peer estimates.
//!
//! Sans-IO: callers supply local timestamps and move the produced requests
//! over whatever transport they use.

use std::collections::HashMap;

use contracts::{ClockSyncConfig, DeviceId};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::error::ClockSyncError;
use crate::peer::{ClockEstimate, PeerClock, SampleOutcome};
use crate::sample::ClockSyncSample;

/// Outbound ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub ping_id: String,
    pub t1_nanos: i64,
    pub requester_id: DeviceId,
}

/// Responder's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongReply {
    pub ping_id: String,
    pub t1_nanos: i64,
    pub t2_nanos: i64,
    pub t3_nanos: i64,
    pub requester_id: DeviceId,
}

#[derive(Debug, Clone)]
struct PendingPing {
    peer: DeviceId,
    t1: i64,
}

/// Estimate handed over by a peer that measured the link itself.
#[derive(Debug, Clone, Copy)]
struct ReportedEstimate {
    estimate: ClockEstimate,
    reported_at: i64,
}

/// Clock offsets between this device and every peer it talks to.
pub struct ClockSyncEngine {
    local_id: DeviceId,
    config: ClockSyncConfig,
    peers: HashMap<DeviceId, PeerClock>,
    reported: HashMap<DeviceId, ReportedEstimate>,
    pending: HashMap<String, PendingPing>,
    next_ping: u64,
}

impl ClockSyncEngine {
    pub fn new(local_id: DeviceId, config: ClockSyncConfig) -> Self {
        Self {
            local_id,
            config,
            peers: HashMap::new(),
            reported: HashMap::new(),
            pending: HashMap::new(),
            next_ping: 0,
        }
    }

    pub fn local_id(&self) -> &DeviceId {
        &self.local_id
    }

    pub fn config(&self) -> &ClockSyncConfig {
        &self.config
    }

    /// Start one exchange with `peer` at local time `t1`.
    pub fn begin_ping(&mut self, peer: &DeviceId, t1: i64) -> PingRequest {
        self.next_ping += 1;
        let ping_id = format!("{}-{}", self.local_id, self.next_ping);
        self.pending.insert(
            ping_id.clone(),
            PendingPing {
                peer: peer.clone(),
                t1,
            },
        );
        trace!(peer = %peer, ping_id = %ping_id, "sync ping");
        PingRequest {
            ping_id,
            t1_nanos: t1,
            requester_id: self.local_id.clone(),
        }
    }

    /// Responder side: stamp receive (`t2`) and send (`t3`) times.
    pub fn respond(ping: &PingRequest, t2: i64, t3: i64) -> PongReply {
        PongReply {
            ping_id: ping.ping_id.clone(),
            t1_nanos: ping.t1_nanos,
            t2_nanos: t2,
            t3_nanos: t3,
            requester_id: ping.requester_id.clone(),
        }
    }

    /// Requester side: complete an exchange received at local time `t4`.
    #[instrument(
        name = "clock_sync_pong",
        skip(self, from, pong),
        fields(peer = %from, ping_id = %pong.ping_id)
    )]
    pub fn handle_pong(
        &mut self,
        from: &DeviceId,
        pong: &PongReply,
        t4: i64,
    ) -> Result<SampleOutcome, ClockSyncError> {
        if pong.requester_id != self.local_id {
            return Err(ClockSyncError::WrongRequester {
                requester_id: pong.requester_id.to_string(),
                local_id: self.local_id.to_string(),
            });
        }
        let pending = self
            .pending
            .remove(&pong.ping_id)
            .ok_or_else(|| ClockSyncError::UnknownPing {
                ping_id: pong.ping_id.clone(),
            })?;
        if &pending.peer != from {
            return Err(ClockSyncError::PeerMismatch {
                ping_id: pong.ping_id.clone(),
                expected: pending.peer.to_string(),
                actual: from.to_string(),
            });
        }

        // Our own t1 is authoritative; the echoed copy is ignored
        let sample = ClockSyncSample::new(pending.t1, pong.t2_nanos, pong.t3_nanos, t4);
        let clock = self
            .peers
            .entry(from.clone())
            .or_insert_with(|| PeerClock::new(self.config.clone()));
        let outcome = clock.add(sample);

        match outcome {
            SampleOutcome::Accepted => {
                if let Some(estimate) = clock.estimate() {
                    debug!(
                        offset_ms = estimate.offset_nanos as f64 / 1e6,
                        uncertainty_ms = estimate.uncertainty_ms,
                        samples = estimate.samples,
                        "clock estimate updated"
                    );
                    metrics::gauge!("timing_clock_offset_ms", "peer" => from.to_string())
                        .set(estimate.offset_nanos as f64 / 1e6);
                    metrics::gauge!("timing_clock_uncertainty_ms", "peer" => from.to_string())
                        .set(estimate.uncertainty_ms);
                }
            }
            SampleOutcome::Rejected(reason) => {
                debug!(?reason, "clock sample rejected");
                metrics::counter!("timing_clock_samples_rejected_total", "peer" => from.to_string())
                    .increment(1);
            }
        }
        Ok(outcome)
    }

    /// Discard pings outstanding longer than the round-trip ceiling.
    pub fn expire_pending(&mut self, now: i64) -> usize {
        let ceiling = self.config.max_round_trip_nanos();
        let before = self.pending.len();
        self.pending.retain(|_, p| now - p.t1 <= ceiling);
        before - self.pending.len()
    }

    pub fn pending_for(&self, peer: &DeviceId) -> usize {
        self.pending.values().filter(|p| &p.peer == peer).count()
    }

    /// Store an estimate the peer measured from its side (`local - peer` there).
    ///
    /// The reported offset is negated so every stored offset reads "peer minus local".
    pub fn record_reported(&mut self, peer: &DeviceId, peer_offset_to_us: i64, uncertainty_ms: f64, now: i64) {
        self.reported.insert(
            peer.clone(),
            ReportedEstimate {
                estimate: ClockEstimate {
                    offset_nanos: -peer_offset_to_us,
                    uncertainty_ms,
                    samples: 0,
                    synced: true,
                },
                reported_at: now,
            },
        );
    }

    /// Best estimate for `peer`: own measurement or peer report, lower uncertainty wins.
    pub fn estimate(&self, peer: &DeviceId) -> Option<ClockEstimate> {
        if peer == &self.local_id {
            return Some(ClockEstimate::local());
        }
        let measured = self.peers.get(peer).and_then(PeerClock::estimate);
        let reported = self.reported.get(peer).map(|r| r.estimate);
        match (measured, reported) {
            (Some(m), Some(r)) => Some(if r.uncertainty_ms < m.uncertainty_ms || !m.synced { r } else { m }),
            (m, r) => m.or(r),
        }
    }

    /// True when no accepted sample (or report) is younger than the resync interval.
    pub fn needs_resync(&self, peer: &DeviceId, now: i64) -> bool {
        let interval = self.config.resync_interval_nanos();
        let measured = self.peers.get(peer).and_then(PeerClock::last_accepted_at);
        let reported = self.reported.get(peer).map(|r| r.reported_at);
        match measured.max(reported) {
            Some(at) => now - at > interval,
            None => true,
        }
    }

    /// Evict aged samples for every peer.
    pub fn prune(&mut self, now: i64) {
        for clock in self.peers.values_mut() {
            clock.prune(now);
        }
    }

    pub fn forget(&mut self, peer: &DeviceId) {
        self.peers.remove(peer);
        self.reported.remove(peer);
        self.pending.retain(|_, p| &p.peer != peer);
    }
}

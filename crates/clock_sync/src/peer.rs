//! Per-peer sample window and offset estimate.

use std::collections::VecDeque;

use contracts::ClockSyncConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sample::ClockSyncSample;

/// Number of lowest-delay samples the estimate is taken from.
const BEST_SAMPLES: usize = 3;

/// Current offset estimate for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockEstimate {
    /// Peer clock minus local clock (ns)
    pub offset_nanos: i64,
    pub uncertainty_ms: f64,
    /// Samples in the window when the estimate was made
    pub samples: usize,
    /// Enough samples for a timed run
    pub synced: bool,
}

impl ClockEstimate {
    /// Identity estimate for the local device.
    pub fn local() -> Self {
        Self {
            offset_nanos: 0,
            uncertainty_ms: 0.0,
            samples: 0,
            synced: true,
        }
    }

    /// Project a timestamp taken on the peer into the local timeline.
    #[inline]
    pub fn to_local(&self, peer_nanos: i64) -> i64 {
        peer_nanos - self.offset_nanos
    }

    /// Project a local timestamp into the peer timeline.
    #[inline]
    pub fn to_peer(&self, local_nanos: i64) -> i64 {
        local_nanos + self.offset_nanos
    }
}

/// Why a sample was not retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NegativeRoundTrip,
    RoundTripTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Accepted,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy)]
struct RetainedSample {
    offset_nanos: i64,
    round_trip_nanos: i64,
    /// Local receive time (`t4`)
    received_at: i64,
}

/// Rolling window of the best recent samples for one peer.
#[derive(Debug, Clone)]
pub struct PeerClock {
    config: ClockSyncConfig,
    samples: VecDeque<RetainedSample>,
    rejected: u64,
    last_accepted_at: Option<i64>,
}

impl PeerClock {
    pub fn new(config: ClockSyncConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window_size),
            config,
            rejected: 0,
            last_accepted_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn last_accepted_at(&self) -> Option<i64> {
        self.last_accepted_at
    }

    pub fn add(&mut self, sample: ClockSyncSample) -> SampleOutcome {
        let round_trip = sample.round_trip_nanos();
        if round_trip < 0 {
            self.rejected += 1;
            return SampleOutcome::Rejected(RejectReason::NegativeRoundTrip);
        }
        if round_trip > self.config.max_round_trip_nanos() {
            self.rejected += 1;
            debug!(
                round_trip_ms = round_trip as f64 / 1e6,
                max_ms = self.config.max_round_trip_ms,
                "clock sample rejected: round trip above ceiling"
            );
            return SampleOutcome::Rejected(RejectReason::RoundTripTooLarge);
        }

        self.prune(sample.t4);
        self.samples.push_back(RetainedSample {
            offset_nanos: sample.offset_nanos(),
            round_trip_nanos: round_trip,
            received_at: sample.t4,
        });
        self.last_accepted_at = Some(sample.t4);

        // Over capacity: evict the worst (highest delay) sample, oldest first on ties
        while self.samples.len() > self.config.window_size.max(1) {
            let worst = self
                .samples
                .iter()
                .enumerate()
                .max_by_key(|(i, s)| (s.round_trip_nanos, std::cmp::Reverse(*i)))
                .map(|(i, _)| i);
            match worst {
                Some(i) => {
                    self.samples.remove(i);
                }
                None => break,
            }
        }
        SampleOutcome::Accepted
    }

    /// Drop samples older than the configured age, relative to `now` (local clock).
    pub fn prune(&mut self, now: i64) {
        let max_age = self.config.max_sample_age_nanos();
        self.samples.retain(|s| now - s.received_at <= max_age);
    }

    /// Median offset of the lowest-delay samples; uncertainty from the best one.
    pub fn estimate(&self) -> Option<ClockEstimate> {
        if self.samples.is_empty() {
            return None;
        }
        let mut ranked: Vec<RetainedSample> = self.samples.iter().copied().collect();
        ranked.sort_by_key(|s| s.round_trip_nanos);
        let best = &ranked[..ranked.len().min(BEST_SAMPLES)];

        let mut offsets: Vec<i64> = best.iter().map(|s| s.offset_nanos).collect();
        offsets.sort_unstable();
        let offset_nanos = offsets[offsets.len() / 2];
        let uncertainty_ms = best[0].round_trip_nanos as f64 / 2.0 / 1e6;

        Some(ClockEstimate {
            offset_nanos,
            uncertainty_ms,
            samples: self.samples.len(),
            synced: self.samples.len() >= self.config.min_samples,
        })
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.last_accepted_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFSET: i64 = 2_345_678_901;

    /// Exchange with `one_way` delay each direction and no jitter
    fn exchange(t1: i64, one_way: i64) -> ClockSyncSample {
        let t2 = t1 + one_way + OFFSET;
        let t3 = t2 + 200_000;
        let t4 = t3 - OFFSET + one_way;
        ClockSyncSample::new(t1, t2, t3, t4)
    }

    /// Asymmetric exchange: slow outbound leg biases the offset
    fn asymmetric(t1: i64, out: i64, back: i64) -> ClockSyncSample {
        let t2 = t1 + out + OFFSET;
        let t3 = t2;
        let t4 = t3 - OFFSET + back;
        ClockSyncSample::new(t1, t2, t3, t4)
    }

    #[test]
    fn test_zero_jitter_recovers_offset_exactly() {
        let mut clock = PeerClock::new(ClockSyncConfig::default());
        for i in 0..5 {
            assert_eq!(clock.add(exchange(i * 100_000_000, 3_000_000)), SampleOutcome::Accepted);
        }
        let estimate = clock.estimate().unwrap();
        assert_eq!(estimate.offset_nanos, OFFSET);
        assert!((estimate.uncertainty_ms - 3.0).abs() < 1e-9);
        assert!(estimate.synced);
    }

    #[test]
    fn test_outlier_rejected_by_ceiling() {
        let mut clock = PeerClock::new(ClockSyncConfig::default());
        for i in 0..4 {
            clock.add(exchange(i * 100_000_000, 10_000_000));
        }
        // 10x the normal round trip, heavily asymmetric
        let outcome = clock.add(asymmetric(500_000_000, 190_000_000, 10_000_000));
        assert_eq!(outcome, SampleOutcome::Rejected(RejectReason::RoundTripTooLarge));
        assert_eq!(clock.rejected(), 1);
        assert_eq!(clock.estimate().unwrap().offset_nanos, OFFSET);
    }

    #[test]
    fn test_outlier_excluded_even_under_loose_ceiling() {
        let config = ClockSyncConfig {
            max_round_trip_ms: 10_000.0,
            ..Default::default()
        };
        let mut clock = PeerClock::new(config);
        for i in 0..4 {
            clock.add(exchange(i * 100_000_000, 10_000_000));
        }
        assert_eq!(
            clock.add(asymmetric(500_000_000, 190_000_000, 10_000_000)),
            SampleOutcome::Accepted
        );
        assert_eq!(clock.estimate().unwrap().offset_nanos, OFFSET);
    }

    #[test]
    fn test_window_keeps_lowest_delay_samples() {
        let config = ClockSyncConfig {
            window_size: 3,
            ..Default::default()
        };
        let mut clock = PeerClock::new(config);
        clock.add(exchange(0, 1_000_000));
        clock.add(exchange(10, 9_000_000));
        clock.add(exchange(20, 2_000_000));
        clock.add(exchange(30, 3_000_000));
        assert_eq!(clock.len(), 3);
        let estimate = clock.estimate().unwrap();
        assert!((estimate.uncertainty_ms - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stale_samples_pruned() {
        let config = ClockSyncConfig {
            max_sample_age_secs: 1.0,
            ..Default::default()
        };
        let mut clock = PeerClock::new(config);
        clock.add(exchange(0, 1_000_000));
        clock.add(exchange(5_000_000_000, 1_000_000));
        assert_eq!(clock.len(), 1);
    }

    #[test]
    fn test_negative_round_trip_rejected() {
        let mut clock = PeerClock::new(ClockSyncConfig::default());
        let outcome = clock.add(ClockSyncSample::new(100, 50, 500, 120));
        assert_eq!(outcome, SampleOutcome::Rejected(RejectReason::NegativeRoundTrip));
        assert!(clock.estimate().is_none());
    }

    #[test]
    fn test_projection_round_trip() {
        let e = ClockEstimate {
            offset_nanos: 1_000,
            uncertainty_ms: 0.5,
            samples: 3,
            synced: true,
        };
        assert_eq!(e.to_local(e.to_peer(42)), 42);
        assert_eq!(e.to_local(1_500), 500);
    }
}

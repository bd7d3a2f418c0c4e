//! Outbound ack tracking with bounded exponential backoff

use std::collections::HashMap;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use contracts::{DeviceId, RetryConfig};

/// A critical message that ran out of attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    pub peer: DeviceId,
    pub message_id: String,
    pub case: &'static str,
    pub run_id: Option<String>,
}

#[derive(Debug)]
struct Pending {
    case: &'static str,
    run_id: Option<String>,
    bytes: Bytes,
    attempts: u32,
    next_at: Instant,
}

/// Work produced by one [`RetryQueue::poll`].
#[derive(Debug, Default)]
pub struct RetryPoll {
    pub resend: Vec<(DeviceId, Bytes)>,
    pub failed: Vec<DeliveryFailure>,
}

/// Messages awaiting ack, keyed by `(peer, message_id)`.
#[derive(Debug)]
pub struct RetryQueue {
    config: RetryConfig,
    pending: HashMap<(DeviceId, String), Pending>,
}

impl RetryQueue {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    /// Start tracking a message whose first attempt went out at `now`.
    pub fn track(
        &mut self,
        peer: DeviceId,
        message_id: String,
        case: &'static str,
        run_id: Option<String>,
        bytes: Bytes,
        now: Instant,
    ) {
        let next_at = now + self.config.backoff(1);
        self.pending.insert(
            (peer, message_id),
            Pending {
                case,
                run_id,
                bytes,
                attempts: 1,
                next_at,
            },
        );
    }

    /// Returns `true` if the ack matched a pending message.
    pub fn acknowledge(&mut self, peer: &DeviceId, message_id: &str) -> bool {
        self.pending
            .remove(&(peer.clone(), message_id.to_string()))
            .is_some()
    }

    /// Drop every pending message tagged with `run_id`.
    pub fn cancel_run(&mut self, run_id: &str) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, p| p.run_id.as_deref() != Some(run_id));
        let flushed = before - self.pending.len();
        if flushed > 0 {
            debug!(run_id, flushed, "flushed pending retries");
        }
        flushed
    }

    /// Drop everything addressed to one peer.
    pub fn forget_peer(&mut self, peer: &DeviceId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(p, _), _| p != peer);
        before - self.pending.len()
    }

    pub fn is_pending(&self, peer: &DeviceId, message_id: &str) -> bool {
        self.pending
            .contains_key(&(peer.clone(), message_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Collect due resends and exhausted messages.
    pub fn poll(&mut self, now: Instant) -> RetryPoll {
        let mut out = RetryPoll::default();
        let max_attempts = self.config.max_attempts.max(1);

        let mut exhausted = Vec::new();
        for ((peer, message_id), pending) in self.pending.iter_mut() {
            if pending.next_at > now {
                continue;
            }
            if pending.attempts >= max_attempts {
                exhausted.push((peer.clone(), message_id.clone()));
                continue;
            }
            pending.attempts += 1;
            pending.next_at = now + self.config.backoff(pending.attempts);
            out.resend.push((peer.clone(), pending.bytes.clone()));
        }

        for key in exhausted {
            if let Some(pending) = self.pending.remove(&key) {
                let (peer, message_id) = key;
                warn!(
                    peer = %peer,
                    message_id = %message_id,
                    case = pending.case,
                    attempts = pending.attempts,
                    "delivery failed"
                );
                out.failed.push(DeliveryFailure {
                    peer,
                    message_id,
                    case: pending.case,
                    run_id: pending.run_id,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> RetryConfig {
        RetryConfig {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 300,
            max_attempts: 3,
            ..RetryConfig::default()
        }
    }

    fn track(queue: &mut RetryQueue, peer: &str, id: &str, run: Option<&str>, now: Instant) {
        queue.track(
            DeviceId::from(peer),
            id.into(),
            "armAll",
            run.map(String::from),
            Bytes::from_static(b"m"),
            now,
        );
    }

    #[test]
    fn test_backoff_schedule_then_failure() {
        let mut queue = RetryQueue::new(config());
        let t0 = Instant::now();
        track(&mut queue, "a", "host-1", None, t0);

        assert!(queue.poll(t0 + Duration::from_millis(99)).resend.is_empty());

        // attempt 2 at +100ms, attempt 3 at +100+200ms
        let t1 = t0 + Duration::from_millis(100);
        assert_eq!(queue.poll(t1).resend.len(), 1);
        assert!(queue.poll(t1 + Duration::from_millis(199)).resend.is_empty());
        let t2 = t1 + Duration::from_millis(200);
        assert_eq!(queue.poll(t2).resend.len(), 1);

        // capped at 300ms, then out of attempts
        let done = queue.poll(t2 + Duration::from_millis(300));
        assert!(done.resend.is_empty());
        assert_eq!(done.failed.len(), 1);
        assert_eq!(done.failed[0].message_id, "host-1");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ack_stops_retries() {
        let mut queue = RetryQueue::new(config());
        let t0 = Instant::now();
        track(&mut queue, "a", "host-1", None, t0);
        assert!(queue.acknowledge(&DeviceId::from("a"), "host-1"));
        assert!(!queue.acknowledge(&DeviceId::from("a"), "host-1"));
        let poll = queue.poll(t0 + Duration::from_secs(10));
        assert!(poll.resend.is_empty() && poll.failed.is_empty());
    }

    #[test]
    fn test_ack_is_per_peer() {
        let mut queue = RetryQueue::new(config());
        let t0 = Instant::now();
        track(&mut queue, "a", "host-1", None, t0);
        track(&mut queue, "b", "host-1", None, t0);
        queue.acknowledge(&DeviceId::from("a"), "host-1");
        assert!(queue.is_pending(&DeviceId::from("b"), "host-1"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cancel_run_flushes_only_that_run() {
        let mut queue = RetryQueue::new(config());
        let t0 = Instant::now();
        track(&mut queue, "a", "host-1", Some("r1"), t0);
        track(&mut queue, "b", "host-1", Some("r1"), t0);
        track(&mut queue, "a", "host-2", Some("r2"), t0);
        track(&mut queue, "a", "host-3", None, t0);

        assert_eq!(queue.cancel_run("r1"), 2);
        assert_eq!(queue.len(), 2);
        assert!(queue.is_pending(&DeviceId::from("a"), "host-2"));
    }
}

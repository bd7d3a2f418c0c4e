//! TimingMessage envelope and per-sender builder.

use std::sync::atomic::{AtomicU64, Ordering};

use contracts::DeviceId;
use serde::{Deserialize, Serialize};

use crate::Payload;

/// Protocol version every peer in a session must speak.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingMessage {
    pub protocol_version: u32,
    /// Strictly increasing per sender
    pub seq: u64,
    pub sender_id: DeviceId,
    pub session_id: String,
    /// Present only when the payload requires an ack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Stable cross-transport dedup key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub payload: Payload,
    /// Sender's monotonic clock (ns)
    pub created_at_nanos: i64,
}

impl TimingMessage {
    pub fn case_name(&self) -> &'static str {
        self.payload.case_name()
    }

    pub fn requires_ack(&self) -> bool {
        self.payload.requires_ack()
    }

    /// Key used for duplicate suppression.
    pub fn dedup_key(&self) -> DedupKey {
        match &self.event_id {
            Some(id) => DedupKey::Event(id.clone()),
            None => DedupKey::Sequence(self.sender_id.clone(), self.seq),
        }
    }
}

/// Identity of one logical delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Event(String),
    Sequence(DeviceId, u64),
}

/// Stamps envelopes for one sender.
///
/// Shared by every producer on a device so `(sender_id, seq)` stays unique.
#[derive(Debug)]
pub struct EnvelopeBuilder {
    sender_id: DeviceId,
    session_id: String,
    last_seq: AtomicU64,
}

impl EnvelopeBuilder {
    pub fn new(sender_id: DeviceId, session_id: impl Into<String>) -> Self {
        Self {
            sender_id,
            session_id: session_id.into(),
            last_seq: AtomicU64::new(0),
        }
    }

    pub fn sender_id(&self) -> &DeviceId {
        &self.sender_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Relaxed)
    }

    pub fn build(&self, payload: Payload, created_at_nanos: i64) -> TimingMessage {
        self.build_with_event(payload, None, created_at_nanos)
    }

    pub fn build_with_event(
        &self,
        payload: Payload,
        event_id: Option<String>,
        created_at_nanos: i64,
    ) -> TimingMessage {
        let seq = self.last_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let message_id = payload
            .requires_ack()
            .then(|| format!("{}-{}", self.sender_id, seq));

        TimingMessage {
            protocol_version: PROTOCOL_VERSION,
            seq,
            sender_id: self.sender_id.clone(),
            session_id: self.session_id.clone(),
            message_id,
            event_id,
            payload,
            created_at_nanos,
        }
    }
}

/// Length of the run/gate prefixes inside an event id.
pub const EVENT_ID_PREFIX_LEN: usize = 8;

/// Deterministic dedup id for a timing event.
pub fn generate_event_id(run_id: &str, gate_id: &str, timestamp_nanos: i64) -> String {
    format!(
        "{}_{}_{}",
        prefix(run_id, EVENT_ID_PREFIX_LEN),
        prefix(gate_id, EVENT_ID_PREFIX_LEN),
        timestamp_nanos
    )
}

fn prefix(s: &str, chars: usize) -> &str {
    match s.char_indices().nth(chars) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

//! Host log of critical broadcasts for reconnect replay

use std::collections::VecDeque;

use protocol::{Payload, TimingMessage};

/// Broadcasts that change the shared session view.
pub fn is_replayable(payload: &Payload) -> bool {
    matches!(
        payload,
        Payload::NewRun { .. }
            | Payload::CancelRun { .. }
            | Payload::Abort { .. }
            | Payload::SessionEnded { .. }
            | Payload::CalibrateAll {}
            | Payload::ArmAll {}
            | Payload::DisarmAll {}
            | Payload::StartRun { .. }
            | Payload::StartTiming {}
            | Payload::StartEvent { .. }
            | Payload::TimingResultBroadcast { .. }
            | Payload::MultiGateResult { .. }
            | Payload::AdjustGateLine { .. }
            | Payload::StartTypeChanged { .. }
            | Payload::DistanceConfigChanged { .. }
            | Payload::PauseDetection {}
            | Payload::ResumeDetection {}
    )
}

#[derive(Debug, Clone)]
struct LogEntry {
    event_id: String,
    run_id: Option<String>,
    message: TimingMessage,
}

/// Bounded, sequence-ordered record of replayable host broadcasts.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    entries: VecDeque<LogEntry>,
    /// Run the following session-scoped entries belong to
    current_run: Option<String>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            current_run: None,
        }
    }

    /// Append a broadcast. Messages without an event id are not replayable.
    pub fn record(&mut self, message: &TimingMessage) {
        let Some(event_id) = message.event_id.clone() else {
            return;
        };
        if let Payload::NewRun { run_id } = &message.payload {
            self.current_run = Some(run_id.clone());
        }
        let run_id = message
            .payload
            .run_id()
            .map(String::from)
            .or_else(|| self.current_run.clone());
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            event_id,
            run_id,
            message: message.clone(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.entries.back().map(|e| e.event_id.as_str())
    }

    /// Entries after `last_seen`, in original order.
    ///
    /// An unknown or missing `last_seen` replays from the first entry of
    /// `run_id`, or the whole log when that run is not in it either.
    pub fn replay(&self, last_seen: Option<&str>, run_id: &str) -> Vec<TimingMessage> {
        let after_seen = last_seen.and_then(|id| {
            self.entries
                .iter()
                .position(|e| e.event_id == id)
                .map(|i| i + 1)
        });
        let from = after_seen
            .or_else(|| {
                self.entries
                    .iter()
                    .position(|e| e.run_id.as_deref() == Some(run_id))
            })
            .unwrap_or(0);
        self.entries
            .iter()
            .skip(from)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Entries broadcast at or after host time `since_nanos`, in original order.
    pub fn replay_since(&self, since_nanos: i64) -> Vec<TimingMessage> {
        self.entries
            .iter()
            .filter(|e| e.message.created_at_nanos >= since_nanos)
            .map(|e| e.message.clone())
            .collect()
    }
}

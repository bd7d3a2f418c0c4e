//! Four-timestamp round trip.

use serde::{Deserialize, Serialize};

/// One ping/pong exchange.
///
/// `t1`/`t4` are in the requester's clock, `t2`/`t3` in the responder's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSyncSample {
    /// Request sent
    pub t1: i64,
    /// Request received by the responder
    pub t2: i64,
    /// Reply sent by the responder
    pub t3: i64,
    /// Reply received
    pub t4: i64,
}

impl ClockSyncSample {
    pub fn new(t1: i64, t2: i64, t3: i64, t4: i64) -> Self {
        Self { t1, t2, t3, t4 }
    }

    /// `(t4 - t1) - (t3 - t2)`: network time, excluding responder processing.
    pub fn round_trip_nanos(&self) -> i64 {
        let total = self.t4 as i128 - self.t1 as i128;
        let processing = self.t3 as i128 - self.t2 as i128;
        (total - processing) as i64
    }

    /// `((t2 - t1) + (t3 - t4)) / 2`: responder clock minus requester clock.
    pub fn offset_nanos(&self) -> i64 {
        let outbound = self.t2 as i128 - self.t1 as i128;
        let inbound = self.t3 as i128 - self.t4 as i128;
        ((outbound + inbound) / 2) as i64
    }

    /// Half the round trip: the largest error a path asymmetry can introduce.
    pub fn uncertainty_nanos(&self) -> i64 {
        self.round_trip_nanos().max(0) / 2
    }
}

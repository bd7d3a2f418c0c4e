//! # Clock Sync
//!
//! NTP-style offset estimation between independently clocked devices.
//!
//! - `sample`: four-timestamp math
//! - `peer`: per-peer rolling window, outlier rejection, estimate
//! - `engine`: ping bookkeeping across peers
//! - `clock`: `MonotonicClock` implementations

pub mod clock;
pub mod engine;
pub mod error;
pub mod peer;
pub mod sample;

pub use clock::{ManualClock, SkewedClock, SystemClock};
pub use engine::{ClockSyncEngine, PingRequest, PongReply};
pub use error::ClockSyncError;
pub use peer::{ClockEstimate, PeerClock, RejectReason, SampleOutcome};
pub use sample::ClockSyncSample;

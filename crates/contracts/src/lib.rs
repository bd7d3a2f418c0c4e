//! # Contracts
//!
//! Frozen interface contracts shared by the timing crates.
//! All business crates can only depend on this crate, reverse dependencies are prohibited.
//!
//! ## Time Model
//! - Every timestamp is a device-local monotonic value in nanoseconds (`i64`)
//! - Cross-device comparisons go through a clock-offset projection onto the host timeline
//! - Wall-clock time only appears in persisted `RunRecord`s

mod blueprint;
mod clock;
mod crossing;
mod detector_config;
mod device_id;
mod error;
mod frame;
mod gate;
mod result;
mod sink;
mod timing_config;

pub use blueprint::*;
pub use clock::MonotonicClock;
pub use crossing::*;
pub use detector_config::*;
pub use device_id::DeviceId;
pub use error::*;
pub use frame::*;
pub use gate::*;
pub use result::*;
pub use sink::*;
pub use timing_config::*;

//! # Protocol
//!
//! Wire envelope shared by every device in a timing session.
//!
//! - [`TimingMessage`] carries one case of the closed [`Payload`] catalogue
//! - [`codec`] is the only place bytes become messages
//! - [`EnvelopeBuilder`] owns the per-sender sequence counter

pub mod codec;
mod error;
mod message;
mod payload;

pub use codec::{decode, encode};
pub use error::ProtocolError;
pub use message::{
    generate_event_id, DedupKey, EnvelopeBuilder, TimingMessage, EVENT_ID_PREFIX_LEN,
    PROTOCOL_VERSION,
};
pub use payload::{ConfigType, DebugLevel, Payload, CASE_NAMES};

//! # Transport
//!
//! Reliable delivery of [`protocol::TimingMessage`]s over a lossy peer link.
//!
//! - Messages with a `messageId` are resent with bounded exponential backoff until acked
//! - Inbound duplicates are dropped by `eventId`, else by `(senderId, seq)`
//! - Exhausted messages surface as [`TransportEvent::DeliveryFailed`]

pub mod dedup;
pub mod error;
pub mod handle;
pub mod link;
pub mod memory;
pub mod metrics;
pub mod retry;

pub use dedup::Deduplicator;
pub use error::TransportError;
pub use handle::{TransportCommand, TransportEvent, TransportHandle};
pub use link::{Datagram, LocalPeerTransport, PeerTransport};
pub use memory::{MemoryLink, MemoryNetwork, NetworkConditions, NetworkStats};
pub use metrics::{TransportMetrics, TransportMetricsSnapshot};
pub use retry::{DeliveryFailure, RetryPoll, RetryQueue};

//! # Session
//!
//! Multi-device session coordination.
//!
//! - `host`: authoritative `SessionState`, role assignment, runs and results
//! - `participant`: broadcast projection and local detector control on a gate device
//! - `splits`: segment split computation on the host timeline
//! - `event_log` / `view`: replayable broadcasts and the state they fold into
//! - `driver`: async task serializing every input of one coordinator
//!
//! Coordinators are sans-IO; the driver moves their [`Output`]s onto the
//! transport and the detector.

pub mod driver;
pub mod error;
pub mod event_log;
pub mod host;
pub mod output;
pub mod participant;
pub mod phase;
pub mod splits;
pub mod versions;
pub mod view;

pub use driver::{Coordinator, DetectorLink, DriverHandle, SessionDriver};
pub use error::CoordinatorError;
pub use event_log::{is_replayable, EventLog};
pub use host::{ActiveRun, DeviceRecord, HostCommand, HostCoordinator, HostSnapshot, SessionState};
pub use output::Output;
pub use participant::{ParticipantCommand, ParticipantCoordinator, ParticipantSnapshot, PeerGate};
pub use phase::SessionPhase;
pub use splits::{compute_splits, ProjectedCrossing, SplitOutcome};
pub use versions::ConfigVersions;
pub use view::{ResultView, SessionView};

//! In-process simulation of a host and its gate devices.

mod camera;
mod course;
mod orchestrator;
mod stats;

pub use camera::{spawn_camera, AthleteScript, CameraSpec, Sprint};
pub use course::{bind_devices, generated_course};
pub use orchestrator::{Simulation, SimulationConfig};
pub use stats::{ClockOutcome, RunOutcome, SimulationStats};

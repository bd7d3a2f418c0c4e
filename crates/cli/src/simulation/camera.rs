//! Synthetic gate cameras watching a scripted athlete.

use std::sync::Arc;
use std::time::Duration;

use contracts::MonotonicClock;
use crossing_detector::mock::{SprintScene, SyntheticScene};
use crossing_detector::FrameSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info_span, Instrument};

const FRAME_WIDTH: u32 = 320;
const FRAME_HEIGHT: u32 = 96;
const PX_PER_METER: f32 = 40.0;

/// One sprint on the true timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sprint {
    /// When the athlete is at `-lead_in_m` (true ns)
    pub start_true_nanos: i64,
    pub speed_mps: f64,
    /// Run-up before the start line (m)
    pub lead_in_m: f64,
}

impl Sprint {
    pub fn position_at(&self, true_nanos: i64) -> Option<f64> {
        let elapsed = (true_nanos - self.start_true_nanos) as f64 / 1e9;
        (elapsed >= 0.0).then(|| elapsed * self.speed_mps - self.lead_in_m)
    }

    /// True time the athlete reaches `distance_m`.
    pub fn arrival_nanos(&self, distance_m: f64) -> i64 {
        self.start_true_nanos + ((distance_m + self.lead_in_m) / self.speed_mps * 1e9) as i64
    }
}

/// Where the athlete is, shared by every camera.
#[derive(Debug, Clone)]
pub struct AthleteScript {
    tx: Arc<watch::Sender<Option<Sprint>>>,
}

impl AthleteScript {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn run(&self, sprint: Sprint) {
        self.tx.send_replace(Some(sprint));
    }

    /// Athlete leaves the course.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn current(&self) -> Option<Sprint> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Sprint>> {
        self.tx.subscribe()
    }
}

impl Default for AthleteScript {
    fn default() -> Self {
        Self::new()
    }
}

/// One gate camera on the course.
#[derive(Debug, Clone)]
pub struct CameraSpec {
    pub gate_id: String,
    pub gate_position: f64,
    pub gate_distance_m: f64,
    pub fps: u32,
}

/// Render frames for one gate until the script is dropped or the queue closes.
///
/// Positions come from `true_clock`; frames are stamped with `device_clock`.
pub fn spawn_camera(
    spec: CameraSpec,
    frames: FrameSender,
    script: watch::Receiver<Option<Sprint>>,
    true_clock: Arc<dyn MonotonicClock>,
    device_clock: Arc<dyn MonotonicClock>,
) -> JoinHandle<u64> {
    let scene = SprintScene::new(
        SyntheticScene::new(FRAME_WIDTH, FRAME_HEIGHT),
        spec.gate_position,
        spec.gate_distance_m,
        PX_PER_METER,
    );
    let period = Duration::from_secs_f64(1.0 / f64::from(spec.fps.max(1)));
    let span = info_span!("sim_camera", gate_id = %spec.gate_id);

    tokio::spawn(
        async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut index = 0u64;
            loop {
                ticker.tick().await;
                if script.has_changed().is_err() {
                    break;
                }
                let sprint = *script.borrow();
                let position = sprint.and_then(|s| s.position_at(true_clock.now_nanos()));
                let frame = scene.frame_at(position, device_clock.now_nanos(), index);
                if frames.send(frame).is_err() {
                    break;
                }
                index += 1;
            }
            debug!(frames = index, "camera stopped");
            index
        }
        .instrument(span),
    )
}

//! Synthetic frame source
//!
//! Paints a bright rectangular athlete on a dark background for tests and
//! simulation without a camera.

use bytes::Bytes;
use contracts::Frame;

/// Static background with an optional bright athlete blob.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub width: u32,
    pub height: u32,
    pub background: u8,
    pub athlete_luma: u8,
    /// Athlete width (px)
    pub athlete_width: f32,
    /// Athlete vertical extent as fractions of frame height
    pub top_fraction: f32,
    pub bottom_fraction: f32,
}

impl SyntheticScene {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            background: 40,
            athlete_luma: 200,
            athlete_width: 60.0,
            top_fraction: 0.2,
            bottom_fraction: 0.85,
        }
    }

    /// Render a packed frame with the athlete's left edge at `athlete_left` (px).
    pub fn render(&self, athlete_left: Option<f32>, timestamp_nanos: i64, frame_index: u64) -> Frame {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut luma = vec![self.background; w * h];

        if let Some(left) = athlete_left {
            let x0 = left.max(0.0).round() as usize;
            let x1 = ((left + self.athlete_width).round().max(0.0) as usize).min(w);
            let y0 = (self.top_fraction * h as f32) as usize;
            let y1 = ((self.bottom_fraction * h as f32) as usize).min(h);
            if x0 < x1 {
                for y in y0..y1 {
                    luma[y * w + x0..y * w + x1].fill(self.athlete_luma);
                }
            }
        }

        Frame::packed(self.width, self.height, Bytes::from(luma), timestamp_nanos, frame_index)
    }
}

/// One gate camera watching an athlete run down the course.
#[derive(Debug, Clone)]
pub struct SprintScene {
    pub scene: SyntheticScene,
    pub gate_position: f64,
    /// Distance of this gate from the start line (m)
    pub gate_distance_m: f64,
    /// Image scale at the gate line
    pub px_per_meter: f32,
}

impl SprintScene {
    pub fn new(scene: SyntheticScene, gate_position: f64, gate_distance_m: f64, px_per_meter: f32) -> Self {
        Self {
            scene,
            gate_position,
            gate_distance_m,
            px_per_meter,
        }
    }

    /// Left edge of the athlete for a course position, `None` when out of view.
    pub fn athlete_left(&self, athlete_position_m: f64) -> Option<f32> {
        let gate_x = self.gate_position as f32 * self.scene.width as f32;
        let centroid = gate_x + (athlete_position_m - self.gate_distance_m) as f32 * self.px_per_meter;
        let left = centroid - self.scene.athlete_width / 2.0;
        let visible = left + self.scene.athlete_width > 0.0 && left < self.scene.width as f32;
        visible.then_some(left)
    }

    pub fn frame_at(&self, athlete_position_m: Option<f64>, timestamp_nanos: i64, frame_index: u64) -> Frame {
        let left = athlete_position_m.and_then(|p| self.athlete_left(p));
        self.scene.render(left, timestamp_nanos, frame_index)
    }
}

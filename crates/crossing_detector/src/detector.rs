//! CrossingDetector state machine.
//!
//! `UNSTABLE → NO_ATHLETE ⇄ ATHLETE_TOO_FAR ⇄ READY → TRIGGERED → COOLDOWN → NO_ATHLETE`
//!
//! One instance per gate camera. `process` must be called with frames in capture
//! order; it never fails, degraded input only lowers the phase.

use contracts::{CrossingEvent, DetectorConfig, DetectorPhase, Frame, GateStatusInfo, ThreeStrips};
use tracing::{debug, info, warn};

use crate::background::BackgroundModel;
use crate::blob::{find_profile_blob, find_vertical_blob, Blob, ProfileBlob};
use crate::sampler::{
    extract_column_profile, extract_sampling_band, extract_three_strips, gate_column,
};
use crate::thumbnail::encode_thumbnail;
use crate::trajectory::{TrackPoint, Trajectory};

const PROFILE_COL_STEP: u32 = 2;
const PROFILE_ROW_STEP: u32 = 4;
const PROFILE_MAX_GAP: usize = 2;

/// Result of feeding one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    /// Phase observed for this frame (`Triggered` only on the trigger frame)
    pub phase: DetectorPhase,
    pub crossing: Option<CrossingEvent>,
}

/// Strip occupancy for one frame.
#[derive(Debug, Clone, Copy)]
enum Occupancy {
    Clear,
    Partial,
    Full([Blob; 3]),
}

pub struct CrossingDetector {
    gate_id: String,
    config: DetectorConfig,
    background: BackgroundModel,
    trajectory: Trajectory,
    phase: DetectorPhase,
    cooldown_until: Option<i64>,
    /// `None` when no motion sensor is available
    gyro_magnitude: Option<f32>,
    /// Set after a trigger (or a missed crossing) until the strips clear
    exiting: bool,
    armed: bool,
    clear: bool,
    frames_since_reset: u32,
    last_frame_index: Option<u64>,
    geometry: Option<(u32, u32)>,
    battery_level: Option<f32>,
}

impl CrossingDetector {
    pub fn new(gate_id: impl Into<String>, config: DetectorConfig) -> Self {
        Self {
            gate_id: gate_id.into(),
            background: BackgroundModel::new(config.background_alpha),
            trajectory: Trajectory::new(config.trajectory_capacity),
            config,
            phase: DetectorPhase::Unstable,
            cooldown_until: None,
            gyro_magnitude: None,
            exiting: false,
            armed: false,
            clear: false,
            frames_since_reset: 0,
            last_frame_index: None,
            geometry: None,
            battery_level: None,
        }
    }

    pub fn gate_id(&self) -> &str {
        &self.gate_id
    }

    pub fn phase(&self) -> DetectorPhase {
        self.phase
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Latest gyro magnitude (rad/s); `None` marks the sensor unavailable.
    pub fn set_gyro_magnitude(&mut self, magnitude: Option<f32>) {
        self.gyro_magnitude = magnitude;
    }

    pub fn set_battery_level(&mut self, level: Option<f32>) {
        self.battery_level = level;
    }

    /// Move the gate line; the background is rebuilt around the new position.
    pub fn set_gate_position(&mut self, position: f64) {
        self.config.gate_position = position.clamp(0.0, 1.0);
        self.recalibrate();
    }

    /// Forget the background and the trajectory and start warming up again.
    pub fn recalibrate(&mut self) {
        info!(gate_id = %self.gate_id, "detector recalibrating");
        self.background.reset();
        self.trajectory.clear();
        self.cooldown_until = None;
        self.exiting = false;
        self.clear = false;
        self.frames_since_reset = 0;
        self.set_phase(DetectorPhase::Unstable);
    }

    fn is_stable(&self) -> bool {
        let threshold = self.config.gyro_threshold_rad_per_sec;
        self.gyro_magnitude.map_or(true, |m| m <= threshold)
    }

    pub fn status(&self) -> GateStatusInfo {
        let calibrated = self.background.is_warm(self.config.warmup_frames);
        GateStatusInfo {
            is_calibrated: calibrated,
            is_armed: self.armed,
            is_clear: calibrated && self.clear,
            is_prebuffer_ready: self.frames_since_reset >= self.config.trajectory_capacity as u32,
            is_stable: self.is_stable(),
            gate_position: self.config.gate_position,
            battery_level: self.battery_level,
        }
    }

    fn set_phase(&mut self, phase: DetectorPhase) {
        if self.phase != phase {
            debug!(
                gate_id = %self.gate_id,
                from = self.phase.as_str(),
                to = phase.as_str(),
                "detector phase change"
            );
            metrics::gauge!("timing_detector_phase", "gate" => self.gate_id.clone())
                .set(phase as u8 as f64);
            self.phase = phase;
        }
    }

    fn outcome(&self) -> FrameOutcome {
        FrameOutcome {
            phase: self.phase,
            crossing: None,
        }
    }

    /// Feed the next frame.
    pub fn process(&mut self, frame: &Frame) -> FrameOutcome {
        if let Some(last) = self.last_frame_index {
            if frame.frame_index <= last {
                debug!(
                    gate_id = %self.gate_id,
                    frame_index = frame.frame_index,
                    last,
                    "frame out of order, skipped"
                );
                return self.outcome();
            }
        }
        self.last_frame_index = Some(frame.frame_index);

        if frame.is_undersized() {
            warn!(
                gate_id = %self.gate_id,
                frame_index = frame.frame_index,
                len = frame.luma.len(),
                required = frame.required_len(),
                "undersized frame treated as empty"
            );
            self.trajectory.clear();
            if matches!(self.phase, DetectorPhase::Ready | DetectorPhase::AthleteTooFar) {
                self.set_phase(DetectorPhase::NoAthlete);
            }
            return FrameOutcome {
                phase: DetectorPhase::NoAthlete,
                crossing: None,
            };
        }

        if self.geometry != Some((frame.width, frame.height)) {
            if self.geometry.is_some() {
                info!(
                    gate_id = %self.gate_id,
                    width = frame.width,
                    height = frame.height,
                    "frame geometry changed"
                );
            }
            self.geometry = Some((frame.width, frame.height));
            self.recalibrate();
        }
        self.frames_since_reset = self.frames_since_reset.saturating_add(1);

        if !self.is_stable() {
            if self.phase != DetectorPhase::Unstable {
                info!(
                    gate_id = %self.gate_id,
                    gyro = ?self.gyro_magnitude,
                    "device moving, background discarded"
                );
                self.background.reset();
                self.trajectory.clear();
                self.cooldown_until = None;
                self.exiting = false;
                self.clear = false;
            }
            self.set_phase(DetectorPhase::Unstable);
            return self.outcome();
        }

        let position = self.config.gate_position;
        let band = extract_sampling_band(frame, position, self.config.sampling_band_width);
        let (x_range, y_range) = self.tracking_window(frame);
        let profile =
            extract_column_profile(frame, x_range, y_range, PROFILE_COL_STEP, PROFILE_ROW_STEP);

        if !self.background.is_warm(self.config.warmup_frames) {
            self.background.update(&band, &profile, None);
            self.set_phase(DetectorPhase::Unstable);
            return self.outcome();
        }
        if self.phase == DetectorPhase::Unstable {
            self.set_phase(DetectorPhase::NoAthlete);
        }

        let threshold = self
            .background
            .diff_threshold(self.config.diff_threshold_min, self.config.diff_threshold_max);
        let strips = extract_three_strips(frame, position);
        let occupancy = self.classify(&strips, threshold, frame.height);

        if self.phase == DetectorPhase::Cooldown {
            match self.cooldown_until {
                Some(deadline) if frame.timestamp_nanos < deadline => {
                    if matches!(occupancy, Occupancy::Clear) {
                        self.mark_clear(&band, &profile, threshold);
                    }
                    return self.outcome();
                }
                _ => {
                    self.cooldown_until = None;
                    self.set_phase(DetectorPhase::NoAthlete);
                }
            }
        }

        if matches!(occupancy, Occupancy::Clear) {
            self.mark_clear(&band, &profile, threshold);
            self.set_phase(DetectorPhase::NoAthlete);
            return self.outcome();
        }
        self.clear = false;

        if self.exiting {
            self.set_phase(DetectorPhase::NoAthlete);
            return self.outcome();
        }

        let blob = find_profile_blob(&profile, self.background.columns(), threshold, PROFILE_MAX_GAP);
        self.track(blob, frame.timestamp_nanos);

        let blobs = match occupancy {
            Occupancy::Full(blobs) => blobs,
            _ => {
                self.set_phase(DetectorPhase::AthleteTooFar);
                return self.outcome();
            }
        };
        self.set_phase(DetectorPhase::Ready);

        match self.crossing_time(frame) {
            Some((timestamp_nanos, velocity)) => self.trigger(frame, &blobs, timestamp_nanos, velocity),
            None => self.outcome(),
        }
    }

    /// A frame without a profile blob breaks the track, so crossings only
    /// interpolate between consecutive frames.
    fn track(&mut self, blob: Option<ProfileBlob>, timestamp_nanos: i64) {
        match blob {
            Some(blob) => self.trajectory.push(TrackPoint {
                x: blob.centroid,
                timestamp_nanos,
                width: blob.width().max(1.0),
            }),
            None => self.trajectory.clear(),
        }
    }

    fn mark_clear(&mut self, band: &contracts::SamplingBand, profile: &[(u32, f32)], threshold: f32) {
        self.clear = true;
        self.exiting = false;
        self.trajectory.clear();
        self.background.update(band, profile, Some(threshold));
    }

    /// Tracking window: gate ± configured fraction of width, middle half of the rows.
    fn tracking_window(&self, frame: &Frame) -> (std::ops::Range<u32>, std::ops::Range<u32>) {
        let gate_x = gate_column(frame.width, self.config.gate_position);
        let half = (self.config.tracking_half_width_fraction * frame.width as f32) as u32;
        let x0 = gate_x.saturating_sub(half);
        let x1 = (gate_x + half + 1).min(frame.width);
        let y0 = frame.height / 4;
        let y1 = (frame.height * 3 / 4).max(y0 + 1);
        (x0..x1, y0..y1)
    }

    fn classify(&self, strips: &ThreeStrips, threshold: f32, height: u32) -> Occupancy {
        let base = (self.config.min_blob_height_fraction * height as f32).ceil();
        let min_height = if self.phase == DetectorPhase::Ready {
            (base * (1.0 - self.config.hysteresis_fraction)).ceil() as usize
        } else {
            base as usize
        };
        let max_gap = (self.config.blob_gap_fraction * height as f32) as usize;
        let rows = self.background.rows();

        let left = find_vertical_blob(&strips.left, rows, threshold, min_height, max_gap);
        let center = find_vertical_blob(&strips.center, rows, threshold, min_height, max_gap);
        let right = find_vertical_blob(&strips.right, rows, threshold, min_height, max_gap);

        match (left, center, right) {
            (Some(l), Some(c), Some(r)) => Occupancy::Full([l, c, r]),
            (None, None, None) => Occupancy::Clear,
            _ => Occupancy::Partial,
        }
    }

    /// Sub-frame crossing time and velocity, if the tracked centroid crossed this frame.
    fn crossing_time(&mut self, frame: &Frame) -> Option<(i64, f32)> {
        let (prev, cur) = self.trajectory.last_pair()?;
        let velocity = self.trajectory.velocity()?;
        if velocity.abs() < self.config.min_velocity_px_per_sec {
            return None;
        }

        let gate_x = gate_column(frame.width, self.config.gate_position) as f32;
        let direction = velocity.signum();
        let prev_rel = (prev.x - gate_x) * direction;
        let cur_rel = (cur.x - gate_x) * direction;

        if prev_rel < 0.0 && cur_rel >= 0.0 {
            let span = cur.x - prev.x;
            let fraction = if span.abs() > f32::EPSILON {
                ((gate_x - prev.x) / span).clamp(0.0, 1.0)
            } else {
                1.0
            };
            let dt = (cur.timestamp_nanos - prev.timestamp_nanos) as f64;
            let t = prev.timestamp_nanos + (fraction as f64 * dt).round() as i64;
            return Some((t, velocity));
        }

        if prev_rel >= 0.0 && cur_rel >= 0.0 {
            // Validated only after the centroid was already past the line
            if cur_rel < self.config.exit_zone_fraction * cur.width {
                let back = (cur_rel / velocity.abs()) as f64 * 1e9;
                return Some((cur.timestamp_nanos - back.round() as i64, velocity));
            }
            debug!(
                gate_id = %self.gate_id,
                progress_px = cur_rel,
                "blob inside exit zone, crossing not counted"
            );
            self.exiting = true;
        }
        None
    }

    fn trigger(
        &mut self,
        frame: &Frame,
        blobs: &[Blob; 3],
        timestamp_nanos: i64,
        velocity: f32,
    ) -> FrameOutcome {
        let confidence = confidence(blobs);
        let thumbnail = if self.config.thumbnail.enabled {
            match encode_thumbnail(frame, self.config.gate_position, &self.config.thumbnail) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(gate_id = %self.gate_id, error = %e, "thumbnail encode failed");
                    None
                }
            }
        } else {
            None
        };

        let event = CrossingEvent {
            timestamp_nanos,
            raw_timestamp_nanos: frame.timestamp_nanos,
            frame_index: frame.frame_index,
            confidence,
            velocity_px_per_sec: velocity,
            thumbnail,
        };

        info!(
            gate_id = %self.gate_id,
            frame_index = frame.frame_index,
            timestamp_nanos,
            confidence,
            velocity,
            "crossing detected"
        );
        metrics::counter!("timing_crossings_total", "gate" => self.gate_id.clone()).increment(1);

        self.cooldown_until = Some(frame.timestamp_nanos + self.config.cooldown_nanos());
        self.exiting = true;
        self.trajectory.clear();
        self.set_phase(DetectorPhase::Triggered);
        self.set_phase(DetectorPhase::Cooldown);

        FrameOutcome {
            phase: DetectorPhase::Triggered,
            crossing: Some(event),
        }
    }
}

/// `0.6 * contrast + 0.4 * torso symmetry`, in `[0, 1]`.
fn confidence(blobs: &[Blob; 3]) -> f32 {
    let contrast = blobs.iter().map(|b| b.contrast).sum::<f32>() / 3.0;
    let contrast_score = (contrast / 100.0).clamp(0.0, 1.0);
    let (hl, hr) = (blobs[0].height() as f32, blobs[2].height() as f32);
    let symmetry = 1.0 - (hl - hr).abs() / hl.max(hr).max(1.0);
    (0.6 * contrast_score + 0.4 * symmetry).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::SyntheticScene;
    use bytes::Bytes;

    const FRAME_NANOS: i64 = 10_000_000; // 100 fps

    fn default_config() -> DetectorConfig {
        DetectorConfig::default()
    }

    struct Harness {
        detector: CrossingDetector,
        scene: SyntheticScene,
        index: u64,
        phases: Vec<DetectorPhase>,
        crossings: Vec<CrossingEvent>,
        timestamps: Vec<i64>,
    }

    impl Harness {
        fn new(config: DetectorConfig) -> Self {
            Self {
                detector: CrossingDetector::new("gate-test", config),
                scene: SyntheticScene::new(640, 120),
                index: 0,
                phases: Vec::new(),
                crossings: Vec::new(),
                timestamps: Vec::new(),
            }
        }

        fn feed(&mut self, athlete_left: Option<f32>) -> FrameOutcome {
            let ts = 1_000_000_000 + self.index as i64 * FRAME_NANOS;
            let frame = self.scene.render(athlete_left, ts, self.index);
            self.index += 1;
            let outcome = self.detector.process(&frame);
            self.phases.push(outcome.phase);
            self.timestamps.push(ts);
            if let Some(c) = &outcome.crossing {
                self.crossings.push(c.clone());
            }
            outcome
        }

        fn warm_up(&mut self) {
            for _ in 0..self.detector.config().warmup_frames {
                self.feed(None);
            }
        }

        fn distinct_phases(&self) -> Vec<DetectorPhase> {
            let mut out: Vec<DetectorPhase> = Vec::new();
            for p in &self.phases {
                if out.last() != Some(p) {
                    out.push(*p);
                }
            }
            out
        }
    }

    #[test]
    fn test_crossing_sequence_and_interpolation() {
        let mut h = Harness::new(default_config());
        h.warm_up();

        // Blob 60px wide moving 30px per frame to the right; gate at x=320
        for left in [220.0, 250.0, 280.0, 310.0, 340.0] {
            h.feed(Some(left));
        }
        // Let the cooldown (0.3s = 30 frames) run out on an empty gate
        for _ in 0..35 {
            h.feed(None);
        }

        assert_eq!(
            h.distinct_phases(),
            vec![
                DetectorPhase::Unstable,
                DetectorPhase::NoAthlete,
                DetectorPhase::Ready,
                DetectorPhase::Triggered,
                DetectorPhase::Cooldown,
                DetectorPhase::NoAthlete,
            ]
        );

        assert_eq!(h.crossings.len(), 1);
        let crossing = &h.crossings[0];
        let trigger_idx = h.phases.iter().position(|p| *p == DetectorPhase::Triggered).unwrap();
        let prev_ts = h.timestamps[trigger_idx - 1];
        let cur_ts = h.timestamps[trigger_idx];
        assert_eq!(crossing.raw_timestamp_nanos, cur_ts);
        assert!(crossing.timestamp_nanos > prev_ts);
        assert!(crossing.timestamp_nanos < cur_ts);
        assert!(crossing.velocity_px_per_sec > 60.0);
        assert!(crossing.confidence > 0.9);
    }

    #[test]
    fn test_frame_without_profile_blob_breaks_the_track() {
        let mut h = Harness::new(default_config());
        h.warm_up();
        for left in [220.0, 250.0, 280.0] {
            h.feed(Some(left));
        }
        let gap_ts = 1_000_000_000 + h.index as i64 * FRAME_NANOS;
        h.index += 1;
        h.detector.track(None, gap_ts);
        assert!(h.detector.trajectory.is_empty());

        // Would interpolate against the frame before the gap otherwise
        let outcome = h.feed(Some(310.0));
        assert!(outcome.crossing.is_none());
        assert_eq!(h.detector.trajectory.len(), 1);
    }

    #[test]
    fn test_gyro_motion_forces_unstable_then_recovers() {
        let mut h = Harness::new(default_config());
        h.warm_up();
        assert_eq!(h.feed(None).phase, DetectorPhase::NoAthlete);

        h.detector.set_gyro_magnitude(Some(1.2));
        assert_eq!(h.feed(None).phase, DetectorPhase::Unstable);
        assert!(!h.detector.status().is_stable);

        h.detector.set_gyro_magnitude(Some(0.05));
        let mut last = DetectorPhase::Unstable;
        for _ in 0..=h.detector.config().warmup_frames {
            last = h.feed(None).phase;
        }
        assert_eq!(last, DetectorPhase::NoAthlete);
        assert!(h.detector.status().is_stable);
    }

    #[test]
    fn test_missing_gyro_is_stable() {
        let mut h = Harness::new(default_config());
        h.detector.set_gyro_magnitude(None);
        h.warm_up();
        assert_eq!(h.feed(None).phase, DetectorPhase::NoAthlete);
    }

    #[test]
    fn test_narrow_object_is_too_far() {
        let mut h = Harness::new(default_config());
        h.scene.athlete_width = 4.0;
        h.warm_up();

        let outcome = h.feed(Some(318.0));
        assert_eq!(outcome.phase, DetectorPhase::AthleteTooFar);
        assert!(h.crossings.is_empty());
    }

    #[test]
    fn test_stationary_body_never_triggers() {
        let mut h = Harness::new(default_config());
        h.warm_up();
        for _ in 0..20 {
            h.feed(Some(290.0));
        }
        assert!(h.crossings.is_empty());
        assert_eq!(h.detector.phase(), DetectorPhase::Ready);
    }

    #[test]
    fn test_cooldown_suppresses_second_crossing() {
        let mut h = Harness::new(default_config());
        h.warm_up();
        for left in [250.0, 280.0, 310.0, 340.0] {
            h.feed(Some(left));
        }
        h.feed(None);
        // Second pass inside the cooldown window
        for left in [250.0, 280.0, 310.0, 340.0] {
            h.feed(Some(left));
        }
        assert_eq!(h.crossings.len(), 1);
    }

    #[test]
    fn test_undersized_frame_is_no_athlete() {
        let mut h = Harness::new(default_config());
        h.warm_up();
        let frame = Frame::packed(640, 120, Bytes::from(vec![0u8; 100]), 5_000_000_000, 1_000);
        let outcome = h.detector.process(&frame);
        assert_eq!(outcome.phase, DetectorPhase::NoAthlete);
        assert!(outcome.crossing.is_none());
    }

    #[test]
    fn test_status_after_warmup() {
        let mut h = Harness::new(default_config());
        assert!(!h.detector.status().can_arm());
        h.warm_up();
        h.feed(None);
        let status = h.detector.status();
        assert!(status.is_calibrated);
        assert!(status.is_clear);
        assert!(status.can_arm());

        h.detector.set_gate_position(0.3);
        let status = h.detector.status();
        assert!(!status.is_calibrated);
        assert_eq!(status.gate_position, 0.3);
        assert_eq!(h.detector.phase(), DetectorPhase::Unstable);
    }

    #[test]
    fn test_noisy_background_does_not_trigger() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut detector = CrossingDetector::new("noisy", default_config());
        for i in 0..200u64 {
            let luma: Vec<u8> = (0..640 * 120).map(|_| 40 + rng.random_range(0..6u8)).collect();
            let frame = Frame::packed(640, 120, Bytes::from(luma), i as i64 * FRAME_NANOS, i);
            let outcome = detector.process(&frame);
            assert!(outcome.crossing.is_none());
        }
        assert_eq!(detector.phase(), DetectorPhase::NoAthlete);
    }
}

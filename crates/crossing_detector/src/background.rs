//! Rolling background luminance model.
//!
//! Two baselines are kept: per-row luminance along the gate line (from the
//! sampling band) and per-column luminance across the tracking window. Both are
//! updated only while the gate is clear so a lingering body is never absorbed.

use contracts::SamplingBand;

/// Background model shared by the strip test and the centroid tracker.
#[derive(Debug, Clone, Default)]
pub struct BackgroundModel {
    rows: Vec<f32>,
    columns: Vec<(u32, f32)>,
    /// EMA of mean absolute row deviation
    noise: f32,
    frames: u32,
    alpha: f32,
}

impl BackgroundModel {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.001, 1.0),
            ..Default::default()
        }
    }

    /// Drop all history (camera moved, gate line changed, geometry changed).
    pub fn reset(&mut self) {
        self.rows.clear();
        self.columns.clear();
        self.noise = 0.0;
        self.frames = 0;
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn is_warm(&self, warmup_frames: u32) -> bool {
        self.frames >= warmup_frames && !self.rows.is_empty()
    }

    pub fn rows(&self) -> &[f32] {
        &self.rows
    }

    pub fn columns(&self) -> &[(u32, f32)] {
        &self.columns
    }

    pub fn noise(&self) -> f32 {
        self.noise
    }

    pub fn mean_luminance(&self) -> f32 {
        if self.rows.is_empty() {
            0.0
        } else {
            self.rows.iter().sum::<f32>() / self.rows.len() as f32
        }
    }

    /// Diff threshold adapted to scene brightness and noise, clamped to `[min, max]`.
    pub fn diff_threshold(&self, min: f32, max: f32) -> f32 {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        (lo + 3.0 * self.noise + 0.04 * self.mean_luminance()).clamp(lo, hi)
    }

    /// Fold one clear frame into the model.
    ///
    /// During warmup the running mean is exact (weight `1/n`); afterwards the
    /// configured EMA weight applies. With `foreground_threshold` set, profile
    /// columns that currently differ by more than it keep their old value.
    pub fn update(
        &mut self,
        band: &SamplingBand,
        profile: &[(u32, f32)],
        foreground_threshold: Option<f32>,
    ) {
        if self.rows.len() != band.rows.len() {
            self.rows = band.rows.clone();
            self.columns = profile.to_vec();
            self.noise = 0.0;
            self.frames = 1;
            return;
        }

        self.frames = self.frames.saturating_add(1);
        let weight = self.alpha.max(1.0 / self.frames as f32);

        let mut deviation = 0.0f32;
        for (model, sample) in self.rows.iter_mut().zip(&band.rows) {
            deviation += (sample - *model).abs();
            *model += weight * (sample - *model);
        }
        deviation /= self.rows.len().max(1) as f32;
        self.noise += weight * (deviation - self.noise);

        if self.columns.len() == profile.len() {
            for ((_, model), (_, sample)) in self.columns.iter_mut().zip(profile) {
                let foreground = foreground_threshold.is_some_and(|t| (sample - *model).abs() > t);
                if !foreground {
                    *model += weight * (sample - *model);
                }
            }
        } else {
            self.columns = profile.to_vec();
        }
    }
}

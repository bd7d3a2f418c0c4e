//! Crossing detector configuration contracts.
//!
//! Defaults come from field calibration and stay configurable.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// What a full frame queue gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued frame
    #[default]
    DropOldest,
    /// Reject the incoming frame
    DropNewest,
}

/// Frame queue between camera and detector
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FrameQueueConfig {
    /// Capacity (frames)
    #[validate(range(min = 1))]
    pub capacity: usize,
    pub drop_policy: DropPolicy,
}

impl Default for FrameQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

/// Crossing thumbnail settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub enabled: bool,
    /// Crop half-width around the gate line (px)
    #[validate(range(min = 4))]
    pub half_width_px: u32,
    #[validate(range(min = 1, max = 100))]
    pub jpeg_quality: u8,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            half_width_px: 48,
            jpeg_quality: 70,
        }
    }
}

/// Detector parameters
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DetectorConfig {
    /// Gate line position (normalised width, 0..1)
    #[validate(range(min = 0.0, max = 1.0))]
    pub gate_position: f64,

    /// Adaptive difference threshold floor (luma)
    #[validate(range(min = 0.0, max = 255.0))]
    pub diff_threshold_min: f32,

    /// Adaptive difference threshold ceiling (luma)
    #[validate(range(min = 0.0, max = 255.0))]
    pub diff_threshold_max: f32,

    /// Minimum blob height (fraction of frame height)
    #[validate(range(min = 0.01, max = 1.0))]
    pub min_blob_height_fraction: f32,

    /// Largest gap bridged inside a blob (fraction of frame height)
    #[validate(range(min = 0.0, max = 0.5))]
    pub blob_gap_fraction: f32,

    /// Minimum crossing speed (px/s)
    #[validate(range(min = 0.0))]
    pub min_velocity_px_per_sec: f32,

    /// Rearm delay after a trigger (s)
    #[validate(range(min = 0.0))]
    pub cooldown_secs: f64,

    /// Gyro magnitude above which the phone counts as moving (rad/s)
    #[validate(range(min = 0.0))]
    pub gyro_threshold_rad_per_sec: f32,

    /// Trajectory buffer capacity (points)
    #[validate(range(min = 2))]
    pub trajectory_capacity: usize,

    /// Width hysteresis applied while READY
    #[validate(range(min = 0.0, max = 0.9))]
    pub hysteresis_fraction: f32,

    /// Exit zone (fraction of blob width)
    #[validate(range(min = 0.0, max = 1.0))]
    pub exit_zone_fraction: f32,

    /// Background warmup frames
    #[validate(range(min = 1))]
    pub warmup_frames: u32,

    /// Background EMA coefficient
    #[validate(range(min = 0.001, max = 1.0))]
    pub background_alpha: f32,

    /// Background sampling band width (columns)
    #[validate(range(min = 1))]
    pub sampling_band_width: u32,

    /// Centroid tracking ROI half-width (fraction of frame width)
    #[validate(range(min = 0.01, max = 0.5))]
    pub tracking_half_width_fraction: f32,

    #[validate(nested)]
    pub thumbnail: ThumbnailConfig,

    #[validate(nested)]
    pub queue: FrameQueueConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            gate_position: 0.5,
            diff_threshold_min: 8.0,
            diff_threshold_max: 40.0,
            min_blob_height_fraction: 0.33,
            blob_gap_fraction: 0.03,
            min_velocity_px_per_sec: 60.0,
            cooldown_secs: 0.3,
            gyro_threshold_rad_per_sec: 0.35,
            trajectory_capacity: 6,
            hysteresis_fraction: 0.25,
            exit_zone_fraction: 0.35,
            warmup_frames: 10,
            background_alpha: 0.05,
            sampling_band_width: 5,
            tracking_half_width_fraction: 0.15,
            thumbnail: ThumbnailConfig::default(),
            queue: FrameQueueConfig::default(),
        }
    }
}

impl DetectorConfig {
    /// Cooldown length in nanoseconds.
    pub fn cooldown_nanos(&self) -> i64 {
        (self.cooldown_secs * 1e9) as i64
    }
}

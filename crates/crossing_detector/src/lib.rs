//! # Crossing Detector
//!
//! Turns a stream of luminance frames from one gate camera into crossing events.
//!
//! Pipeline: `Frame → StripSampler → BackgroundModel / blob search → CrossingDetector → DetectorEvent`
//!
//! The detector itself is synchronous and single-owner; [`DetectorPipeline`] runs it
//! on a dedicated thread behind a bounded frame queue.

pub mod background;
pub mod blob;
pub mod detector;
pub mod error;
pub mod mock;
pub mod pipeline;
pub mod sampler;
pub mod thumbnail;
pub mod trajectory;

pub use detector::{CrossingDetector, FrameOutcome};
pub use error::DetectorError;
pub use pipeline::{
    DetectorCommand, DetectorEvent, DetectorPipeline, FrameSender, PipelineMetrics,
    PipelineMetricsSnapshot,
};
pub use sampler::{extract_column, extract_sampling_band, extract_three_strips};

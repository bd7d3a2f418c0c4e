//! Frame and strip data types consumed by the crossing detector.
//!
//! Time model: every timestamp is a monotonic device-local value in nanoseconds.

use bytes::Bytes;

/// One luminance frame from the camera source.
///
/// `luma` holds one byte per pixel, row-major, with `row_stride` bytes per row
/// (stride may include padding beyond `width`).
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub row_stride: u32,
    pub luma: Bytes,
    /// Monotonic capture time (ns)
    pub timestamp_nanos: i64,
    /// Strictly increasing per device
    pub frame_index: u64,
}

impl Frame {
    /// Create a tightly packed frame (`row_stride == width`).
    pub fn packed(width: u32, height: u32, luma: Bytes, timestamp_nanos: i64, frame_index: u64) -> Self {
        Self {
            width,
            height,
            row_stride: width,
            luma,
            timestamp_nanos,
            frame_index,
        }
    }

    /// Bytes a well-formed frame of this geometry must carry.
    #[inline]
    pub fn required_len(&self) -> usize {
        self.height as usize * self.row_stride as usize
    }

    /// True when the buffer is too short or the geometry is unusable.
    pub fn is_undersized(&self) -> bool {
        self.width == 0
            || self.height == 0
            || self.row_stride < self.width
            || self.luma.len() < self.required_len()
    }
}

/// Three columns extracted at `center - delta`, `center`, `center + delta`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreeStrips {
    pub left: Vec<u8>,
    pub center: Vec<u8>,
    pub right: Vec<u8>,
    /// Column indices actually sampled (after clamping)
    pub columns: [u32; 3],
    pub timestamp_nanos: i64,
    pub frame_index: u64,
}

impl ThreeStrips {
    pub fn height(&self) -> usize {
        self.center.len()
    }
}

/// Per-row average of a few columns centred on the gate line.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingBand {
    pub rows: Vec<f32>,
    pub band_width: u32,
    pub timestamp_nanos: i64,
}

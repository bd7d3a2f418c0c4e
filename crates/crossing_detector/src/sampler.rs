//! Strip sampling around the gate line.
//!
//! All column positions are clamped into `[0, width - 1]` before any read, so no
//! gate position can index outside the row.

use contracts::{Frame, SamplingBand, ThreeStrips};

/// Copy column `x` of a row-major luminance buffer.
///
/// `x` must already be clamped to the frame width. Rows past the end of a short
/// buffer read as 0.
pub fn extract_column(buffer: &[u8], row_stride: usize, height: usize, x: usize) -> Vec<u8> {
    (0..height)
        .map(|y| buffer.get(y * row_stride + x).copied().unwrap_or(0))
        .collect()
}

/// Horizontal separation between the three strips for a frame width.
#[inline]
pub fn strip_delta(width: u32) -> u32 {
    (width / 100).max(3)
}

/// Gate line column for a normalized position.
#[inline]
pub fn gate_column(width: u32, gate_position: f64) -> u32 {
    let max_x = width.saturating_sub(1);
    let x = (gate_position.clamp(0.0, 1.0) * width as f64) as u32;
    x.min(max_x)
}

#[inline]
fn clamp_column(x: i64, width: u32) -> usize {
    x.clamp(0, width.saturating_sub(1) as i64) as usize
}

/// Extract left/center/right strips at `center ± delta`.
pub fn extract_three_strips(frame: &Frame, gate_position: f64) -> ThreeStrips {
    let center = gate_column(frame.width, gate_position) as i64;
    let delta = strip_delta(frame.width) as i64;
    let stride = frame.row_stride as usize;
    let height = frame.height as usize;

    let left_x = clamp_column(center - delta, frame.width);
    let center_x = clamp_column(center, frame.width);
    let right_x = clamp_column(center + delta, frame.width);

    ThreeStrips {
        left: extract_column(&frame.luma, stride, height, left_x),
        center: extract_column(&frame.luma, stride, height, center_x),
        right: extract_column(&frame.luma, stride, height, right_x),
        columns: [left_x as u32, center_x as u32, right_x as u32],
        timestamp_nanos: frame.timestamp_nanos,
        frame_index: frame.frame_index,
    }
}

/// Average `band_width` columns centred on the gate line, per row.
pub fn extract_sampling_band(frame: &Frame, gate_position: f64, band_width: u32) -> SamplingBand {
    let band_width = band_width.max(1);
    let center = gate_column(frame.width, gate_position) as i64;
    let half = (band_width / 2) as i64;
    let stride = frame.row_stride as usize;
    let columns: Vec<usize> = (0..band_width as i64)
        .map(|i| clamp_column(center - half + i, frame.width))
        .collect();

    let rows = (0..frame.height as usize)
        .map(|y| {
            let row = y * stride;
            let sum: u32 = columns
                .iter()
                .map(|&x| frame.luma.get(row + x).copied().unwrap_or(0) as u32)
                .sum();
            sum as f32 / columns.len() as f32
        })
        .collect();

    SamplingBand {
        rows,
        band_width,
        timestamp_nanos: frame.timestamp_nanos,
    }
}

/// Mean luminance per sampled column over a horizontal band of rows.
///
/// Returns `(x, mean)` pairs for `x` in `x_range` stepping by `col_step`, averaged
/// over rows in `y_range` stepping by `row_step`.
pub fn extract_column_profile(
    frame: &Frame,
    x_range: std::ops::Range<u32>,
    y_range: std::ops::Range<u32>,
    col_step: u32,
    row_step: u32,
) -> Vec<(u32, f32)> {
    let stride = frame.row_stride as usize;
    let col_step = col_step.max(1) as usize;
    let row_step = row_step.max(1) as usize;
    let x_end = x_range.end.min(frame.width);
    let y_end = y_range.end.min(frame.height);
    let rows: Vec<usize> = (y_range.start..y_end).step_by(row_step).map(|y| y as usize).collect();
    if rows.is_empty() {
        return Vec::new();
    }

    (x_range.start..x_end)
        .step_by(col_step)
        .map(|x| {
            let sum: u32 = rows
                .iter()
                .map(|&y| frame.luma.get(y * stride + x as usize).copied().unwrap_or(0) as u32)
                .sum();
            (x, sum as f32 / rows.len() as f32)
        })
        .collect()
}

//! Crossing thumbnails: grayscale JPEG crop around the gate line, base64 encoded.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use contracts::{ContractError, Frame, ThumbnailConfig};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::sampler::gate_column;

/// Crop `[gate - half_width, gate + half_width)` over all rows and encode it.
pub fn encode_thumbnail(
    frame: &Frame,
    gate_position: f64,
    config: &ThumbnailConfig,
) -> Result<String, ContractError> {
    if frame.is_undersized() {
        return Err(ContractError::ThumbnailEncode {
            message: format!("frame {} is undersized", frame.frame_index),
        });
    }

    let center = gate_column(frame.width, gate_position);
    let left = center.saturating_sub(config.half_width_px);
    let right = (center + config.half_width_px).min(frame.width);
    let crop_width = right - left;
    if crop_width == 0 {
        return Err(ContractError::ThumbnailEncode {
            message: "empty crop".to_string(),
        });
    }

    let stride = frame.row_stride as usize;
    let mut pixels = Vec::with_capacity(crop_width as usize * frame.height as usize);
    for y in 0..frame.height as usize {
        let row = y * stride;
        pixels.extend_from_slice(&frame.luma[row + left as usize..row + right as usize]);
    }

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, config.jpeg_quality.clamp(1, 100))
        .encode(&pixels, crop_width, frame.height, ExtendedColorType::L8)
        .map_err(|e| ContractError::ThumbnailEncode {
            message: e.to_string(),
        })?;

    Ok(STANDARD.encode(jpeg))
}

/// Decode a base64 thumbnail back into JPEG bytes.
pub fn decode_thumbnail(data: &str) -> Result<Vec<u8>, ContractError> {
    STANDARD
        .decode(data)
        .map_err(|e| ContractError::ThumbnailEncode {
            message: e.to_string(),
        })
}

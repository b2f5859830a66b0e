//! Snapshot decoder (§4.6a) — stateless from the caller's perspective: given a
//! single self-contained `Keyframe`, decode it to a raw frame, color-convert
//! to RGB, JPEG-encode, return bytes.

use super::decoder::H264Decoder;
use crate::error::{AppError, Result};
use bytes::Bytes;

/// Serializes snapshot decodes so at most one runs concurrently per printer
/// (§4.6), since the decoder context is not safe to drive from two callers
/// at once and decoding is CPU-expensive.
pub struct SnapshotDecoder {
    lock: tokio::sync::Mutex<()>,
}

impl SnapshotDecoder {
    pub fn new() -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn decode(&self, keyframe: Bytes, jpeg_quality: u8) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().await;
        tokio::task::spawn_blocking(move || decode_and_encode(&keyframe, jpeg_quality))
            .await
            .map_err(|e| AppError::Internal(format!("snapshot task panicked: {e}")))?
    }
}

impl Default for SnapshotDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_and_encode(keyframe: &[u8], jpeg_quality: u8) -> Result<Vec<u8>> {
    let image = H264Decoder::decode_one(keyframe)?;

    let tj_image = turbojpeg::Image {
        pixels: image.rgb.as_slice(),
        width: image.width,
        pitch: image.width * 3,
        height: image.height,
        format: turbojpeg::PixelFormat::RGB,
    };

    let jpeg = turbojpeg::compress(tj_image, jpeg_quality as i32, turbojpeg::Subsamp::Sub2x2)
        .map_err(|e| AppError::Internal(format!("jpeg encode failed: {e}")))?;

    Ok(jpeg.to_vec())
}

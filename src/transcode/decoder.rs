//! Narrow H.264 decode interface (§9 design note: "FFmpeg-style decoder
//! contexts must be wrapped behind a narrow... interface, so implementations
//! can choose any H.264 library"). `openh264` is the chosen library, aligned
//! with the dependency in the example pack's `prusa-rtsp-streamer` manifest;
//! nothing outside this module names it directly.

use crate::error::{AppError, Result};
use openh264::decoder::Decoder as Openh264Decoder;
use openh264::nal_units;

/// One decoded RGB8 image, row-major, no padding.
pub struct DecodedImage {
    pub width: usize,
    pub height: usize,
    pub rgb: Vec<u8>,
}

/// Open stream / feed frames / close, matching the design note's required
/// shape. Each instance decodes frames for a single printer; it is not
/// `Clone` because the underlying decoder keeps reference-frame state.
pub struct H264Decoder {
    inner: Openh264Decoder,
}

impl H264Decoder {
    pub fn new() -> Result<Self> {
        let inner = Openh264Decoder::new()
            .map_err(|e| AppError::Internal(format!("failed to open h264 decoder: {e}")))?;
        Ok(Self { inner })
    }

    /// Feed one Annex-B NAL-unit sequence (a `Keyframe` or `InterFrame`
    /// payload). Returns `Some` once a full picture has been reconstructed.
    pub fn feed(&mut self, annex_b: &[u8]) -> Result<Option<DecodedImage>> {
        let mut last = None;
        for packet in nal_units(annex_b) {
            match self.inner.decode(packet) {
                Ok(Some(yuv)) => {
                    let (width, height) = yuv.dimensions();
                    let mut rgb = vec![0u8; yuv.rgb8_len()];
                    yuv.write_rgb8(&mut rgb);
                    last = Some(DecodedImage { width, height, rgb });
                }
                Ok(None) => {}
                Err(e) => return Err(AppError::Internal(format!("h264 decode error: {e}"))),
            }
        }
        Ok(last)
    }

    /// Decode a single self-contained keyframe (already SPS/PPS-prefixed per
    /// §3) to one image, used by the snapshot decoder which has no ongoing
    /// decoder-context lifetime to manage.
    pub fn decode_one(annex_b: &[u8]) -> Result<DecodedImage> {
        let mut decoder = Self::new()?;
        decoder
            .feed(annex_b)?
            .ok_or_else(|| AppError::Internal("keyframe did not decode to a full picture".into()))
    }
}

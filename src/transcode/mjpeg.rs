//! Continuous MJPEG encoder (§4.6b) — activated while ≥1 MJPEG client is
//! attached (deactivated after a 10s linger), decodes every delivered frame,
//! throttles to `max_fps`, JPEG-encodes, and republishes to the secondary
//! MJPEG fan-out for HTTP clients.

use super::decoder::H264Decoder;
use crate::hub::{Frame, FrameFanOutHub, MjpegFanOut, SubscriberKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const LINGER: Duration = Duration::from_secs(10);
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Runs for the lifetime of the printer; internally cycles between idle
/// (no clients) and active (decoding) phases. Returns when `cancel` fires.
pub async fn run(
    hub: Arc<FrameFanOutHub>,
    fanout: Arc<MjpegFanOut>,
    jpeg_quality: u8,
    max_fps: u32,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        if fanout.client_count() == 0 {
            tokio::select! {
                _ = tokio::time::sleep(IDLE_POLL) => continue,
                _ = cancel.cancelled() => return,
            }
        }

        active_phase(&hub, &fanout, jpeg_quality, max_fps, &cancel).await;
    }
}

async fn active_phase(
    hub: &Arc<FrameFanOutHub>,
    fanout: &Arc<MjpegFanOut>,
    jpeg_quality: u8,
    max_fps: u32,
    cancel: &CancellationToken,
) {
    let sub = hub.subscribe(SubscriberKind::Mjpeg);
    let mut decoder = match H264Decoder::new() {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(error = %e, "failed to open mjpeg decoder");
            return;
        }
    };

    let min_frame_interval = if max_fps > 0 {
        Some(Duration::from_secs_f64(1.0 / max_fps as f64))
    } else {
        None
    };
    let mut last_encoded_at: Option<Instant> = None;
    let mut empty_since: Option<Instant> = None;

    loop {
        if fanout.client_count() == 0 {
            let since = *empty_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= LINGER {
                return;
            }
        } else {
            empty_since = None;
        }

        let frame = tokio::select! {
            frame = sub.recv() => frame,
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(IDLE_POLL) => continue,
        };

        let Some(frame) = frame else {
            // Subscriber was torn down by the hub (shouldn't happen for the
            // MJPEG kind, which never overflows-tears-down); resubscribe.
            return;
        };

        let payload = match &*frame {
            Frame::VideoSequenceHeader { .. } => continue,
            Frame::Keyframe { bytes, .. } | Frame::InterFrame { bytes, .. } => bytes,
        };

        if let Some(interval) = min_frame_interval {
            if let Some(last) = last_encoded_at {
                if last.elapsed() < interval {
                    // Drop newest per §4.6: previous frame not yet "due" to
                    // be superseded.
                    continue;
                }
            }
        }

        match decoder.feed(payload) {
            Ok(Some(image)) => {
                let fanout = fanout.clone();
                match encode_jpeg(image, jpeg_quality) {
                    Ok(jpeg) => {
                        fanout.publish(jpeg.into());
                        last_encoded_at = Some(Instant::now());
                    }
                    Err(e) => tracing::warn!(error = %e, "mjpeg jpeg encode failed"),
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "mjpeg h264 decode failed"),
        }
    }
}

fn encode_jpeg(
    image: super::decoder::DecodedImage,
    jpeg_quality: u8,
) -> crate::Result<Vec<u8>> {
    let tj_image = turbojpeg::Image {
        pixels: image.rgb.as_slice(),
        width: image.width,
        pitch: image.width * 3,
        height: image.height,
        format: turbojpeg::PixelFormat::RGB,
    };
    turbojpeg::compress(tj_image, jpeg_quality as i32, turbojpeg::Subsamp::Sub2x2)
        .map(|buf| buf.to_vec())
        .map_err(|e| crate::AppError::Internal(format!("jpeg encode failed: {e}")))
}

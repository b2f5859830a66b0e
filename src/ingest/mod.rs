//! Ingest Stream Reader (§4.4) — pulls the FLV/H.264 stream from the printer
//! and publishes decoded frames onto the Frame Fan-Out Hub.

pub mod flv;

use crate::error::{AppError, Result};
use crate::hub::{Frame, FrameFanOutHub};
use bytes::Bytes;
use flv::{DecodedVideoTag, FlvTagReader};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Fixed path and port for the supported device family (§4.4, §6).
const INGEST_PORT: u16 = 18088;
const INGEST_PATH: &str = "/flv";
const FIRST_BYTE_DEADLINE: Duration = Duration::from_secs(15);

/// 1-second sliding-window incoming-frame-rate counter. This is the sole FPS
/// field surfaced in `PrinterStatus` (§9 open-question resolution: no
/// separate `IdleFps`/`CurrentFps`).
#[derive(Default)]
pub struct FpsCounter {
    timestamps: Mutex<VecDeque<Instant>>,
}

impl FpsCounter {
    pub fn record(&self) {
        let now = Instant::now();
        let mut ts = self.timestamps.lock();
        ts.push_back(now);
        while let Some(front) = ts.front() {
            if now.duration_since(*front) > Duration::from_secs(1) {
                ts.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn fps(&self) -> u32 {
        self.timestamps.lock().len() as u32
    }
}

/// Shared, lock-free-readable ingest statistics surfaced to `PrinterStatus`.
pub struct IngestStats {
    pub fps: FpsCounter,
    pub frames_received: AtomicU64,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self {
            fps: FpsCounter::default(),
            frames_received: AtomicU64::new(0),
        }
    }
}

/// Runs the ingest loop until the connection ends, a malformed frame is
/// encountered, or `cancel` fires. Each call represents one ingest session;
/// `monotonic_seq` resets to 0 at the start of every call (§3 invariant).
pub async fn run(
    host: &str,
    hub: Arc<FrameFanOutHub>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) -> Result<()> {
    let connect = TcpStream::connect((host, INGEST_PORT));
    let mut stream = tokio::select! {
        result = tokio::time::timeout(FIRST_BYTE_DEADLINE, connect) => {
            result.map_err(|_| AppError::Timeout("ingest connect".into()))??
        }
        _ = cancel.cancelled() => return Err(AppError::Cancelled),
    };

    let request = format!(
        "GET {INGEST_PATH} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    read_http_response_headers(&mut reader).await?;

    let mut flv = FlvTagReader::new(reader);
    tokio::select! {
        result = tokio::time::timeout(FIRST_BYTE_DEADLINE, flv.read_header()) => {
            result.map_err(|_| AppError::Timeout("ingest first byte".into()))?.map_err(AppError::from)?;
        }
        _ = cancel.cancelled() => return Err(AppError::Cancelled),
    };

    let mut monotonic_seq: u64 = 0;
    let mut pts_origin: Option<u32> = None;
    let mut current_sps_pps: Option<(Bytes, Bytes)> = None;

    loop {
        let next = tokio::select! {
            tag = flv.next_video_tag() => tag.map_err(AppError::from)?,
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
        };

        let tag = match next {
            Some(tag) => tag,
            None => return Err(AppError::Network("ingest stream ended".into())),
        };

        match tag {
            DecodedVideoTag::SequenceHeader {
                sps,
                pps,
                width,
                height,
            } => {
                current_sps_pps = Some((sps.clone(), pps.clone()));
                hub.publish(Frame::VideoSequenceHeader {
                    sps,
                    pps,
                    width,
                    height,
                });
            }
            DecodedVideoTag::Nalu {
                bytes,
                is_keyframe,
                timestamp_ms,
            } => {
                let origin = *pts_origin.get_or_insert(timestamp_ms);
                let pts_ms = timestamp_ms.saturating_sub(origin) as u64;

                monotonic_seq += 1;
                stats.fps.record();
                stats.frames_received.fetch_add(1, Ordering::Relaxed);

                let bytes = if is_keyframe {
                    prefix_with_parameter_sets(bytes, current_sps_pps.as_ref())
                } else {
                    bytes
                };

                publish_nalu(&hub, bytes, is_keyframe, pts_ms, monotonic_seq);
            }
        }
    }
}

/// A `Keyframe` is "self-contained (prefixed with current SPS/PPS)" per §3,
/// so any subscriber that attaches mid-stream can decode it without having
/// separately retained the sequence header.
fn prefix_with_parameter_sets(nalu: Bytes, sps_pps: Option<&(Bytes, Bytes)>) -> Bytes {
    let Some((sps, pps)) = sps_pps else {
        return nalu;
    };
    const START_CODE: [u8; 4] = [0, 0, 0, 1];
    let mut out = bytes::BytesMut::with_capacity(sps.len() + pps.len() + nalu.len() + 12);
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(sps);
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(pps);
    out.extend_from_slice(&nalu);
    out.freeze()
}

fn publish_nalu(
    hub: &FrameFanOutHub,
    bytes: Bytes,
    is_keyframe: bool,
    pts_ms: u64,
    monotonic_seq: u64,
) {
    let frame = if is_keyframe {
        Frame::Keyframe {
            bytes,
            pts_ms,
            monotonic_seq,
        }
    } else {
        Frame::InterFrame {
            bytes,
            pts_ms,
            monotonic_seq,
        }
    };
    hub.publish(frame);
}

async fn read_http_response_headers(
    reader: &mut BufReader<TcpStream>,
) -> Result<()> {
    use tokio::io::AsyncBufReadExt;

    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    if !status_line.starts_with("HTTP/1.") || !status_line.contains("200") {
        return Err(AppError::Protocol(format!(
            "unexpected ingest response status: {}",
            status_line.trim()
        )));
    }

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_counter_counts_within_window() {
        let counter = FpsCounter::default();
        for _ in 0..5 {
            counter.record();
        }
        assert_eq!(counter.fps(), 5);
    }

    #[test]
    fn fps_counter_evicts_old_entries() {
        let counter = FpsCounter::default();
        counter.timestamps.lock().push_back(Instant::now() - Duration::from_secs(2));
        counter.record();
        assert_eq!(counter.fps(), 1);
    }
}

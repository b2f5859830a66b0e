//! Route handlers (§4.7). Grounded on the teacher's `src/web/handlers/mod.rs`
//! (`mjpeg_stream`'s bounded-channel backpressure + `async_stream` body,
//! `snapshot`'s direct single-JPEG response) generalized from one process-wide
//! stream to the per-printer `SupervisorHandle` passed in as axum `State`.

use super::subscriber_cap_reached;
use crate::hub::Frame;
use crate::supervisor::{PrinterStatus, SupervisorHandle, SupervisorState};
use crate::{AppError, Result};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

fn state_label(state: SupervisorState) -> &'static str {
    match state {
        SupervisorState::Disabled => "disabled",
        SupervisorState::Connecting => "connecting",
        SupervisorState::Running => "running",
        SupervisorState::Paused => "paused",
        SupervisorState::Retrying => "retrying",
        SupervisorState::Failed => "failed",
    }
}

/// 503 carrying `X-ACProxyCam-State` (§4.7), used by every video endpoint
/// when the printer isn't `Running`.
fn not_running(state: SupervisorState) -> Response {
    let mut response = (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(crate::error::ErrorResponse {
            success: false,
            message: format!("printer is {}", state_label(state)),
        }),
    )
        .into_response();
    response
        .headers_mut()
        .insert("X-ACProxyCam-State", HeaderValue::from_static(state_label(state)));
    response
}

fn too_many_subscribers() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(crate::error::ErrorResponse {
            success: false,
            message: "subscriber limit reached".to_string(),
        }),
    )
        .into_response()
}

pub async fn status(State(handle): State<SupervisorHandle>) -> Json<PrinterStatus> {
    Json(handle.status())
}

#[derive(Deserialize)]
pub struct LedQuery {
    #[serde(default = "default_brightness")]
    brightness: u8,
}

fn default_brightness() -> u8 {
    255
}

pub async fn led_status(State(handle): State<SupervisorHandle>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "led": handle.status().led }))
}

pub async fn led_on(
    State(handle): State<SupervisorHandle>,
    Query(query): Query<LedQuery>,
) -> Result<Json<serde_json::Value>> {
    handle.set_led(true, query.brightness).await?;
    Ok(Json(serde_json::json!({ "on": true, "brightness": query.brightness })))
}

pub async fn led_off(State(handle): State<SupervisorHandle>) -> Result<Json<serde_json::Value>> {
    handle.set_led(false, 0).await?;
    Ok(Json(serde_json::json!({ "on": false, "brightness": 0 })))
}

/// Single JPEG snapshot (§4.6a) decoded on demand from the hub's cached
/// keyframe.
pub async fn snapshot(State(handle): State<SupervisorHandle>) -> Response {
    let status = handle.status();
    if status.state != SupervisorState::Running {
        return not_running(status.state);
    }
    let Some(keyframe) = handle.hub.last_keyframe() else {
        return not_running(SupervisorState::Connecting);
    };
    let Some(bytes) = keyframe.payload().cloned() else {
        return not_running(SupervisorState::Connecting);
    };

    match handle.snapshot.decode(bytes, handle.jpeg_quality()).await {
        Ok(jpeg) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "image/jpeg")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(jpeg))
            .unwrap(),
        Err(err) => err.into_response(),
    }
}

/// `multipart/x-mixed-replace` MJPEG stream (§4.6b), one part per fan-out
/// publish.
pub async fn stream(State(handle): State<SupervisorHandle>) -> Response {
    let status = handle.status();
    if status.state != SupervisorState::Running {
        return not_running(status.state);
    }
    if subscriber_cap_reached(&handle) {
        return too_many_subscribers();
    }

    let fanout = handle.mjpeg_fanout.clone();
    let guard = fanout.register_client();
    let mut notify = fanout.subscribe();

    let body_stream = async_stream::stream! {
        let _guard = guard;
        if let Some(jpeg) = fanout.current() {
            yield Ok::<bytes::Bytes, std::io::Error>(create_mjpeg_part(&jpeg));
        }
        loop {
            match notify.recv().await {
                Ok(()) => {
                    if let Some(jpeg) = fanout.current() {
                        yield Ok::<bytes::Bytes, std::io::Error>(create_mjpeg_part(&jpeg));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap()
}

fn create_mjpeg_part(jpeg: &[u8]) -> bytes::Bytes {
    use bytes::{BufMut, BytesMut};
    let mut buf = BytesMut::with_capacity(64 + jpeg.len());
    buf.put_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    buf.put_slice(jpeg.len().to_string().as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

pub async fn hls_ll_playlist(State(handle): State<SupervisorHandle>) -> Response {
    let status = handle.status();
    if status.state != SupervisorState::Running {
        return not_running(status.state);
    }
    playlist_response(handle.hls_state.ll_hls_playlist())
}

pub async fn hls_legacy_playlist(State(handle): State<SupervisorHandle>) -> Response {
    let status = handle.status();
    if status.state != SupervisorState::Running {
        return not_running(status.state);
    }
    playlist_response(handle.hls_state.legacy_playlist())
}

fn playlist_response(body: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .unwrap()
}

fn mp4_segment_response(body: bytes::Bytes) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .unwrap()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

/// Catch-all for `/hls/init.mp4`, `/hls/segment-{n}.m4s` and
/// `/hls/part-{n}-{p}.m4s`. Matchit (axum's router) can only match a whole
/// path segment as either a literal or a param, not a literal/param mix
/// within one segment, so the file name is parsed here instead of split
/// across three distinct route patterns.
pub async fn hls_blob(State(handle): State<SupervisorHandle>, Path(file): Path<String>) -> Response {
    let status = handle.status();
    if status.state != SupervisorState::Running {
        return not_running(status.state);
    }

    if file == "init.mp4" {
        return match handle.hls_state.init_segment() {
            Some(init) => mp4_segment_response(init),
            None => not_found(),
        };
    }

    if let Some(rest) = file.strip_prefix("segment-").and_then(|s| s.strip_suffix(".m4s")) {
        return match rest.parse::<u64>().ok().and_then(|n| handle.hls_state.segment(n)) {
            Some(segment) => mp4_segment_response(segment.data()),
            None => not_found(),
        };
    }

    if let Some(rest) = file.strip_prefix("part-").and_then(|s| s.strip_suffix(".m4s")) {
        if let Some((seg, part)) = rest.split_once('-') {
            return match (seg.parse::<u64>().ok(), part.parse::<u64>().ok()) {
                (Some(seg), Some(part)) => match handle.hls_state.part(seg, part) {
                    Some(part) => mp4_segment_response(part.fragment.clone()),
                    None => not_found(),
                },
                _ => not_found(),
            };
        }
    }

    not_found()
}

/// Used by `ws.rs` to decide whether to accept a new `/h264` subscriber.
pub fn ensure_running_and_available(handle: &SupervisorHandle) -> std::result::Result<(), AppError> {
    let status = handle.status();
    if status.state != SupervisorState::Running {
        return Err(AppError::DeviceUnavailable(format!(
            "printer is {}",
            state_label(status.state)
        )));
    }
    if subscriber_cap_reached(handle) {
        return Err(AppError::DeviceUnavailable("subscriber limit reached".into()));
    }
    Ok(())
}

/// Encodes a `Frame` as the Annex-B NAL-unit bytes sent over `/h264`; the
/// header frame carries no single NALU so its SPS/PPS are sent back to back,
/// each prefixed with a start code to stay a well-formed NAL unit on the wire.
pub(super) fn frame_to_ws_payload(frame: &Frame) -> bytes::Bytes {
    match frame {
        Frame::VideoSequenceHeader { sps, pps, .. } => {
            let mut out = bytes::BytesMut::with_capacity(sps.len() + pps.len() + 8);
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(sps);
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(pps);
            out.freeze()
        }
        Frame::Keyframe { bytes, .. } | Frame::InterFrame { bytes, .. } => bytes.clone(),
    }
}

//! HTTP / WebSocket Front-End (§4.7) — one `axum::Router` per printer, bound
//! to that printer's own listener. Grounded on the teacher's `src/web/
//! routes.rs` (router construction, `TraceLayer`) and `src/utils/net.rs`
//! (`bind_tcp_listener`'s raw-socket IPv6-only binding), generalized from one
//! process-wide router to one router per printer since each printer owns its
//! own `listen_port`.

pub mod handlers;
pub mod ws;

use crate::supervisor::SupervisorHandle;
use crate::utils::net::bind_tcp_listener;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Hard cap on simultaneous video subscribers per printer (§4.7).
pub const MAX_SUBSCRIBERS_PER_PRINTER: usize = 32;

pub fn build_router(handle: SupervisorHandle) -> Router {
    Router::new()
        .route("/stream", get(handlers::stream))
        .route("/snapshot", get(handlers::snapshot))
        .route("/status", get(handlers::status))
        .route("/led", get(handlers::led_status))
        .route("/led/on", get(handlers::led_on))
        .route("/led/off", get(handlers::led_off))
        .route("/h264", get(ws::h264_ws_handler))
        .route("/hls/playlist.m3u8", get(handlers::hls_ll_playlist))
        .route("/hls/legacy.m3u8", get(handlers::hls_legacy_playlist))
        .route("/hls/:file", get(handlers::hls_blob))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Binds and serves one printer's router until `cancel` fires. Spawned once
/// per printer by the daemon whenever a Supervisor is created or a printer's
/// `listen_port`/`listen_interfaces` changes.
pub async fn serve(
    addr: SocketAddr,
    handle: SupervisorHandle,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let std_listener = bind_tcp_listener(addr)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;
    let app = build_router(handle);

    tracing::info!(%addr, "printer HTTP listener bound");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| crate::AppError::Network(e.to_string()))
}

/// True once `hub.total_subscribers() + mjpeg_fanout.client_count()` would
/// exceed the cap if one more video client were admitted.
pub fn subscriber_cap_reached(handle: &SupervisorHandle) -> bool {
    let total = handle.hub.total_subscribers() + handle.mjpeg_fanout.client_count();
    total >= MAX_SUBSCRIBERS_PER_PRINTER
}

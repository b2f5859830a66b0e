//! `/h264` WebSocket endpoint (§4.7) — binary frames, one per NAL unit
//! sequence, header first. Grounded on the teacher's `src/web/ws.rs`
//! (`ws.on_upgrade` entry point, `tokio::select!` send/receive loop,
//! heartbeat ping), generalized from the teacher's JSON event bus to raw
//! binary video frames sourced from the hub instead.

use super::handlers::{ensure_running_and_available, frame_to_ws_payload};
use crate::hub::SubscriberKind;
use crate::supervisor::SupervisorHandle;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::time::Duration;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn h264_ws_handler(
    State(handle): State<SupervisorHandle>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = ensure_running_and_available(&handle) {
        return err.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, handle))
}

async fn handle_socket(socket: WebSocket, handle: SupervisorHandle) {
    let sub = handle.hub.subscribe(SubscriberKind::WsH264);
    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            frame = sub.recv() => {
                match frame {
                    Some(frame) => {
                        let payload = frame_to_ws_payload(&frame);
                        if sender.send(Message::Binary(payload.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    handle.hub.unsubscribe(sub.id);
}

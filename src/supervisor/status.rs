//! `PrinterStatus` (§3) — the in-memory, observable record the IPC server and
//! HTTP front-end read to answer `get_status`/`/status` without touching the
//! supervisor's internal state machine directly.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Disabled,
    Connecting,
    Running,
    Paused,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientCounts {
    pub ws_h264: usize,
    pub hls: usize,
    pub mjpeg: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemState {
    Down,
    Connecting,
    Up,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedState {
    pub on: bool,
    pub brightness: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrinterStatus {
    pub name: String,
    pub state: SupervisorState,
    pub clients: ClientCounts,
    /// Measured incoming frame rate from the Ingest Reader (§9 open-question
    /// resolution: the sole fps field, no separate idle/current split).
    pub fps: u32,
    pub last_error: Option<(String, DateTime<Utc>)>,
    pub last_seen_online: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub ssh: SubsystemState,
    pub mqtt: SubsystemState,
    pub stream: SubsystemState,
    pub led: Option<LedState>,
}

impl PrinterStatus {
    pub fn disabled(name: String) -> Self {
        Self {
            name,
            state: SupervisorState::Disabled,
            clients: ClientCounts::default(),
            fps: 0,
            last_error: None,
            last_seen_online: None,
            next_retry_at: None,
            ssh: SubsystemState::Down,
            mqtt: SubsystemState::Down,
            stream: SubsystemState::Down,
            led: None,
        }
    }
}

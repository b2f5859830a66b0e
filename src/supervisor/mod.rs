//! Printer Supervisor (§4.1) — the central per-printer state machine. Owns
//! every child component (credential cache, MQTT control channel, ingest
//! task, on-demand transcoders, Frame Fan-Out Hub) and guarantees ordered
//! teardown on every exit path.

mod backoff;
pub mod status;

pub use status::{ClientCounts, LedState, PrinterStatus, SubsystemState, SupervisorState};

use crate::config::{ConfigChange, ConfigStore, PrinterConfig};
use crate::credentials::{self, CredentialRecord};
use crate::error::AppError;
use crate::hub::{FrameFanOutHub, MjpegFanOut, SubscriberKind};
use crate::ingest::{self, IngestStats};
use crate::mqtt::{ControlChannel, ControlEvent};
use crate::transcode::{hls, mjpeg, HlsState, SnapshotDecoder};
use arc_swap::ArcSwap;
use backoff::Backoff;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_PERMANENT_FAILURES: u32 = 3;
const CAMERA_START_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

pub enum SupervisorCommand {
    Pause,
    Resume,
    Stop,
}

/// Caller-facing view of a running Supervisor. Cloneable cheaply; the Daemon
/// holds one per configured printer and the HTTP front-end holds references
/// to the shared hub/transcoder state to serve requests without routing
/// through the supervisor task itself.
#[derive(Clone)]
pub struct SupervisorHandle {
    pub name: String,
    status: Arc<ArcSwap<PrinterStatus>>,
    commands: mpsc::Sender<SupervisorCommand>,
    cancel: CancellationToken,
    pub hub: Arc<FrameFanOutHub>,
    pub mjpeg_fanout: Arc<MjpegFanOut>,
    pub hls_state: Arc<HlsState>,
    pub snapshot: Arc<SnapshotDecoder>,
    mqtt: Arc<ArcSwap<Option<Arc<ControlChannel>>>>,
    config_store: Arc<ConfigStore>,
}

impl SupervisorHandle {
    pub fn status(&self) -> PrinterStatus {
        (**self.status.load()).clone()
    }

    /// Current `jpeg_quality` (§4.6) for this printer, read live from the
    /// config store so an operator's `modify_printer` takes effect on the
    /// very next snapshot/MJPEG frame without a Supervisor restart.
    pub fn jpeg_quality(&self) -> u8 {
        current_config(&self.config_store, &self.name)
            .map(|c| c.jpeg_quality)
            .unwrap_or(80)
    }

    pub async fn pause(&self) {
        let _ = self.commands.send(SupervisorCommand::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.commands.send(SupervisorCommand::Resume).await;
    }

    /// Cooperative shutdown: cancels the supervisor task. Does not wait for
    /// teardown to complete — callers that need that should hold the
    /// `JoinHandle` returned by `spawn`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Issues `led_set` over the live control channel. Fails with
    /// `DeviceUnavailable` when the printer isn't currently connected.
    pub async fn set_led(&self, on: bool, brightness: u8) -> crate::Result<()> {
        match &**self.mqtt.load() {
            Some(mqtt) => mqtt.set_led(on, brightness).await,
            None => Err(AppError::DeviceUnavailable(format!(
                "printer '{}' is not connected",
                self.name
            ))),
        }
    }
}

/// Spawns the supervisor task for `name` and returns a handle plus the task's
/// `JoinHandle` (the Daemon awaits this on full shutdown).
pub fn spawn(
    config_store: Arc<ConfigStore>,
    name: String,
    change_rx: broadcast::Receiver<ConfigChange>,
) -> (SupervisorHandle, JoinHandle<()>) {
    let initial_enabled = config_store
        .get()
        .printers
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.enabled)
        .unwrap_or(false);

    let initial_state = if initial_enabled {
        SupervisorState::Connecting
    } else {
        SupervisorState::Disabled
    };
    let mut initial_status = PrinterStatus::disabled(name.clone());
    initial_status.state = initial_state;

    let status = Arc::new(ArcSwap::from_pointee(initial_status));
    let (command_tx, command_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();

    let hub = Arc::new(FrameFanOutHub::new(crate::hub::DEFAULT_RING_CAPACITY));
    let mjpeg_fanout = Arc::new(MjpegFanOut::new());
    let hls_state = Arc::new(HlsState::new());
    let snapshot = Arc::new(SnapshotDecoder::new());
    let mqtt_handle = Arc::new(ArcSwap::from_pointee(None));

    let handle = SupervisorHandle {
        name: name.clone(),
        status: status.clone(),
        commands: command_tx,
        cancel: cancel.clone(),
        hub: hub.clone(),
        mjpeg_fanout: mjpeg_fanout.clone(),
        hls_state: hls_state.clone(),
        snapshot: snapshot.clone(),
        mqtt: mqtt_handle.clone(),
        config_store: config_store.clone(),
    };

    let task = tokio::spawn(run(
        name,
        config_store,
        change_rx,
        command_rx,
        status,
        hub,
        mjpeg_fanout,
        hls_state,
        mqtt_handle,
        cancel,
    ));

    (handle, task)
}

struct RunningChildren {
    ingest: JoinHandle<crate::Result<()>>,
    ingest_cancel: CancellationToken,
    stats: Arc<IngestStats>,
    mqtt: Arc<ControlChannel>,
    mjpeg_task: JoinHandle<()>,
    hls_task: JoinHandle<()>,
    transcoder_cancel: CancellationToken,
}

impl RunningChildren {
    /// Ordered teardown (§4.1): front-end is the caller's concern (it reads
    /// `hub`/`mjpeg_fanout`/`hls_state` directly and notices the 503 state
    /// transition); here we tear down hub subscribers, then transcoders, then
    /// ingest, then MQTT.
    async fn teardown(self, hub: &FrameFanOutHub, mqtt_handle: &ArcSwap<Option<Arc<ControlChannel>>>) {
        hub.reset();
        self.transcoder_cancel.cancel();
        let _ = self.mjpeg_task.await;
        let _ = self.hls_task.await;
        self.ingest_cancel.cancel();
        let _ = self.ingest.await;
        mqtt_handle.store(Arc::new(None));
        drop(self.mqtt); // drops the last Arc, running ControlChannel's Drop (aborts event loop)
    }
}

#[tracing::instrument(skip_all, fields(printer = %name))]
async fn run(
    name: String,
    config_store: Arc<ConfigStore>,
    mut change_rx: broadcast::Receiver<ConfigChange>,
    mut commands: mpsc::Receiver<SupervisorCommand>,
    status: Arc<ArcSwap<PrinterStatus>>,
    hub: Arc<FrameFanOutHub>,
    mjpeg_fanout: Arc<MjpegFanOut>,
    hls_state: Arc<HlsState>,
    mqtt_handle: Arc<ArcSwap<Option<Arc<ControlChannel>>>>,
    cancel: CancellationToken,
) {
    let mut state = status.load().state;
    let mut backoff = Backoff::default();
    let mut permanent_failures: u32 = 0;
    let mut cached_credential: Option<CredentialRecord> = None;
    let mut running: Option<RunningChildren> = None;

    loop {
        if cancel.is_cancelled() {
            if let Some(children) = running.take() {
                children.teardown(&hub, &mqtt_handle).await;
            }
            return;
        }

        let config = current_config(&config_store, &name);
        let Some(config) = config else {
            // Printer was deleted out from under us.
            if let Some(children) = running.take() {
                children.teardown(&hub, &mqtt_handle).await;
            }
            return;
        };

        match state {
            SupervisorState::Disabled => {
                publish_state(&status, &name, state, 0, None, None);
                tokio::select! {
                    _ = cancel.cancelled() => continue,
                    _ = change_rx.recv() => {
                        if current_config(&config_store, &name).map(|c| c.enabled).unwrap_or(false) {
                            state = SupervisorState::Connecting;
                        }
                    }
                    cmd = commands.recv() => {
                        if matches!(cmd, Some(SupervisorCommand::Resume)) {
                            state = SupervisorState::Connecting;
                        }
                    }
                }
            }

            SupervisorState::Connecting => {
                publish_state(&status, &name, state, 0, None, None);
                let attempt = tokio::select! {
                    result = connect_sequence(&config, &mut cached_credential, &hub) => result,
                    _ = cancel.cancelled() => continue,
                };

                match attempt {
                    Ok(children) => {
                        permanent_failures = 0;
                        backoff.reset();
                        mqtt_handle.store(Arc::new(Some(children.mqtt.clone())));
                        running = Some(children);
                        state = SupervisorState::Running;
                        let _ = config_store
                            .record_learned_fields(
                                &name,
                                cached_credential.as_ref().map(|c| c.device_id.clone()),
                                cached_credential.as_ref().and_then(|c| c.device_type.clone()),
                                cached_credential.as_ref().and_then(|c| c.model_code.clone()),
                            )
                            .await;
                        spawn_transcoders(&mut running, &hub, &mjpeg_fanout, &hls_state, &config);
                    }
                    Err(e) => {
                        if e.is_permanent() {
                            // Permanent failures invalidate any cached
                            // credential — it may be the stale/wrong one.
                            cached_credential = None;
                            permanent_failures += 1;
                        }
                        publish_error(&status, &name, state, &e);
                        state = if permanent_failures >= MAX_PERMANENT_FAILURES {
                            SupervisorState::Failed
                        } else {
                            SupervisorState::Retrying
                        };
                    }
                }
            }

            SupervisorState::Running => {
                let children = running.as_mut().expect("Running state always has children");
                tokio::select! {
                    result = &mut children.ingest => {
                        let children = running.take().unwrap();
                        children.teardown(&hub, &mqtt_handle).await;
                        let err = result.unwrap_or(Err(AppError::Internal("ingest task panicked".into())));
                        if let Err(e) = err {
                            publish_error(&status, &name, state, &e);
                        }
                        state = SupervisorState::Retrying;
                    }
                    _ = cancel.cancelled() => continue,
                    _ = change_rx.recv() => {
                        if !current_config(&config_store, &name).map(|c| c.enabled).unwrap_or(false) {
                            let children = running.take().unwrap();
                            children.teardown(&hub, &mqtt_handle).await;
                            state = SupervisorState::Disabled;
                        }
                    }
                    cmd = commands.recv() => {
                        match cmd {
                            Some(SupervisorCommand::Pause) => {
                                let children = running.take().unwrap();
                                children.teardown(&hub, &mqtt_handle).await;
                                state = SupervisorState::Paused;
                            }
                            Some(SupervisorCommand::Stop) | None => continue,
                            Some(SupervisorCommand::Resume) => {}
                        }
                    }
                }
                if state == SupervisorState::Running {
                    let fps = running.as_ref().expect("Running state always has children").stats.fps.fps();
                    publish_running(&status, &name, &hub, &mjpeg_fanout, fps);
                }
            }

            SupervisorState::Paused => {
                publish_state(&status, &name, state, 0, None, None);
                tokio::select! {
                    _ = cancel.cancelled() => continue,
                    _ = change_rx.recv() => {
                        if !current_config(&config_store, &name).map(|c| c.enabled).unwrap_or(false) {
                            state = SupervisorState::Disabled;
                        }
                    }
                    cmd = commands.recv() => {
                        if matches!(cmd, Some(SupervisorCommand::Resume)) {
                            state = SupervisorState::Connecting;
                        }
                    }
                }
            }

            SupervisorState::Retrying => {
                let delay = backoff.next_delay();
                let next_retry_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                publish_state(&status, &name, state, 0, None, Some(next_retry_at));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => { state = SupervisorState::Connecting; }
                    _ = cancel.cancelled() => continue,
                    cmd = commands.recv() => {
                        if matches!(cmd, Some(SupervisorCommand::Pause)) {
                            state = SupervisorState::Paused;
                        }
                    }
                }
            }

            SupervisorState::Failed => {
                publish_state(&status, &name, state, 0, None, None);
                tokio::select! {
                    _ = cancel.cancelled() => continue,
                    _ = change_rx.recv() => {
                        permanent_failures = 0;
                        state = SupervisorState::Connecting;
                    }
                    cmd = commands.recv() => {
                        if matches!(cmd, Some(SupervisorCommand::Resume)) {
                            permanent_failures = 0;
                            state = SupervisorState::Connecting;
                        }
                    }
                }
            }
        }
    }
}

fn current_config(store: &ConfigStore, name: &str) -> Option<PrinterConfig> {
    store.get().printers.iter().find(|p| p.name == name).cloned()
}

/// Deterministic connect sequence (§4.1 steps ①-⑥).
async fn connect_sequence(
    config: &PrinterConfig,
    cached_credential: &mut Option<CredentialRecord>,
    hub: &Arc<FrameFanOutHub>,
) -> crate::Result<RunningChildren> {
    // ① resolve host: nothing to resolve beyond the configured literal — DNS
    // resolution, if any, happens inside the TCP/SSH connect calls below.
    let host = config.host.clone();

    // ② SSH one-shot for credentials, skipped if cached.
    if cached_credential.is_none() {
        let record = credentials::acquire(&host, config.ssh_port, &config.ssh_user, config.ssh_password.expose())
            .await
            .map_err(AppError::from)?;
        *cached_credential = Some(record);
    }
    let credential = cached_credential.as_ref().expect("just populated").clone();

    // ③ open MQTT.
    let (event_tx, mut event_rx) = mpsc::channel(32);
    let mqtt = ControlChannel::connect(
        &host,
        config.mqtt_port,
        &credential.device_id,
        &credential.mqtt_username,
        &credential.mqtt_password,
        event_tx,
    )
    .await?;

    // ④ publish "camera on".
    mqtt.camera_start().await?;

    // ⑤ await camera_started=true within 30s.
    tokio::time::timeout(CAMERA_START_DEADLINE, wait_for_camera_started(&mut event_rx))
        .await
        .map_err(|_| AppError::Timeout("camera_started report".into()))??;

    // ⑥ open the FLV ingest.
    let ingest_cancel = CancellationToken::new();
    let ingest_stats = Arc::new(IngestStats::default());
    let stats = ingest_stats.clone();
    let ingest_hub = hub.clone();
    let ingest_host = host.clone();
    let ingest_cancel_child = ingest_cancel.clone();
    let ingest = tokio::spawn(async move {
        ingest::run(&ingest_host, ingest_hub, ingest_stats, ingest_cancel_child).await
    });

    // The mpsc receiver for MQTT events is dropped here; reconnect/disconnect
    // notifications surface to the Supervisor through the ingest task's own
    // failure instead, since a lost MQTT session on these devices also stops
    // the camera and therefore the ingest stream.
    drop(event_rx);

    Ok(RunningChildren {
        ingest,
        ingest_cancel,
        stats,
        mqtt: Arc::new(mqtt),
        mjpeg_task: tokio::spawn(async {}),
        hls_task: tokio::spawn(async {}),
        transcoder_cancel: CancellationToken::new(),
    })
}

async fn wait_for_camera_started(rx: &mut mpsc::Receiver<ControlEvent>) -> crate::Result<()> {
    while let Some(event) = rx.recv().await {
        match event {
            ControlEvent::ReportUpdated(report) if report.camera_started => return Ok(()),
            ControlEvent::Disconnected(reason) => return Err(AppError::Network(reason)),
            _ => {}
        }
    }
    Err(AppError::Network("mqtt event channel closed".into()))
}

fn spawn_transcoders(
    running: &mut Option<RunningChildren>,
    hub: &Arc<FrameFanOutHub>,
    mjpeg_fanout: &Arc<MjpegFanOut>,
    hls_state: &Arc<HlsState>,
    config: &PrinterConfig,
) {
    let Some(children) = running.as_mut() else { return };
    let transcoder_cancel = CancellationToken::new();

    let mjpeg_task = if config.mjpeg_enabled {
        tokio::spawn(mjpeg::run(
            hub.clone(),
            mjpeg_fanout.clone(),
            config.jpeg_quality,
            config.max_fps,
            transcoder_cancel.clone(),
        ))
    } else {
        tokio::spawn(async {})
    };

    let hls_task = if config.hls_enabled || config.ll_hls_enabled {
        tokio::spawn(hls::run(
            hub.clone(),
            hls_state.clone(),
            transcoder_cancel.clone(),
        ))
    } else {
        tokio::spawn(async {})
    };

    children.mjpeg_task = mjpeg_task;
    children.hls_task = hls_task;
    children.transcoder_cancel = transcoder_cancel;
}

/// `fps` is the live measured incoming frame rate (§3/§9) when a stream is
/// active, 0 otherwise — callers outside `Running` have no ingest task to
/// measure from, so they always pass 0 rather than carry a stale reading
/// forward.
fn publish_state(
    status: &Arc<ArcSwap<PrinterStatus>>,
    name: &str,
    state: SupervisorState,
    fps: u32,
    last_error: Option<(String, chrono::DateTime<Utc>)>,
    next_retry_at: Option<chrono::DateTime<Utc>>,
) {
    let previous = status.load();
    tracing::info!(state = ?state, "printer state transition");
    let new = PrinterStatus {
        name: name.to_string(),
        state,
        clients: previous.clients.clone(),
        fps,
        last_error: last_error.or_else(|| previous.last_error.clone()),
        last_seen_online: previous.last_seen_online,
        next_retry_at,
        ssh: previous.ssh,
        mqtt: previous.mqtt,
        stream: previous.stream,
        led: previous.led.clone(),
    };
    status.store(Arc::new(new));
}

fn publish_error(status: &Arc<ArcSwap<PrinterStatus>>, name: &str, state: SupervisorState, error: &AppError) {
    tracing::warn!(error = %error, "printer connect attempt failed");
    publish_state(
        status,
        name,
        state,
        0,
        Some((error.to_string(), Utc::now())),
        None,
    );
}

fn publish_running(
    status: &Arc<ArcSwap<PrinterStatus>>,
    name: &str,
    hub: &FrameFanOutHub,
    mjpeg_fanout: &MjpegFanOut,
    fps: u32,
) {
    let previous = status.load();
    let new = PrinterStatus {
        name: name.to_string(),
        state: SupervisorState::Running,
        clients: ClientCounts {
            ws_h264: hub.subscriber_count(SubscriberKind::WsH264),
            hls: hub.subscriber_count(SubscriberKind::Hls),
            mjpeg: mjpeg_fanout.client_count(),
        },
        fps,
        last_error: previous.last_error.clone(),
        last_seen_online: Some(Utc::now()),
        next_retry_at: None,
        ssh: SubsystemState::Up,
        mqtt: SubsystemState::Up,
        stream: SubsystemState::Up,
        led: previous.led.clone(),
    };
    status.store(Arc::new(new));
}

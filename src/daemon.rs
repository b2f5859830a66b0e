//! Process-wide Daemon (§4.8) — owns the Config Store and reconciles one
//! Printer Supervisor plus its HTTP listener(s) per configured printer,
//! spawning/restarting/stopping them as config changes arrive. Grounded on
//! the teacher's `src/state.rs` (`AppState` aggregate-struct pattern) and
//! `main.rs`'s `bind_tcp_listeners`/sequential-construction/`cleanup()`
//! ordering, generalized from "one process-wide router" to "N per-printer
//! routers reconciled at runtime" since printers can be added/removed
//! without restarting the process.

use crate::config::{ConfigChange, ConfigStore, PrinterConfig};
use crate::supervisor::{self, SupervisorHandle};
use crate::web;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct ListenerRuntime {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct PrinterRuntime {
    handle: SupervisorHandle,
    supervisor_task: JoinHandle<()>,
    listeners: Vec<ListenerRuntime>,
    bound_port: u16,
    bound_interfaces: Vec<String>,
}

pub struct Daemon {
    pub config_store: Arc<ConfigStore>,
    printers: Mutex<HashMap<String, PrinterRuntime>>,
}

impl Daemon {
    /// Constructs the daemon and starts a Supervisor + listener set for every
    /// printer already present in the config store.
    pub async fn new(config_store: Arc<ConfigStore>) -> Arc<Self> {
        let daemon = Arc::new(Self {
            config_store,
            printers: Mutex::new(HashMap::new()),
        });
        daemon.reconcile_all().await;
        daemon
    }

    /// Runs until `cancel` fires, reconciling printers against config-change
    /// events as they arrive.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = self.config_store.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => {
                    match change {
                        Ok(_change) => self.reconcile_all().await,
                        Err(broadcast::error::RecvError::Lagged(_)) => self.reconcile_all().await,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        self.shutdown().await;
    }

    pub async fn status_for(&self, name: &str) -> Option<crate::supervisor::PrinterStatus> {
        self.printers.lock().await.get(name).map(|r| r.handle.status())
    }

    pub async fn list_status(&self) -> Vec<crate::supervisor::PrinterStatus> {
        self.printers
            .lock()
            .await
            .values()
            .map(|r| r.handle.status())
            .collect()
    }

    pub async fn handle_for(&self, name: &str) -> Option<SupervisorHandle> {
        self.printers.lock().await.get(name).map(|r| r.handle.clone())
    }

    /// Adds a printer to the config store (validates uniqueness) and
    /// reconciles immediately so the new printer comes up without waiting for
    /// the change-event loop's next poll.
    pub async fn add_printer(&self, config: PrinterConfig) -> crate::Result<()> {
        self.config_store.add_printer(config).await?;
        self.reconcile_all().await;
        Ok(())
    }

    pub async fn delete_printer(&self, name: &str) -> crate::Result<()> {
        self.config_store.delete_printer(name).await?;
        self.reconcile_all().await;
        Ok(())
    }

    pub async fn modify_printer(&self, original_name: &str, config: PrinterConfig) -> crate::Result<()> {
        self.config_store.modify_printer(original_name, config).await?;
        self.reconcile_all().await;
        Ok(())
    }

    /// Compares the config store against currently running Supervisors and
    /// starts, stops, or rebinds listeners for whatever changed. Per-field
    /// Supervisor reactions (enable/disable, host, credentials, ...) are
    /// handled by the Supervisor task itself via its own `ConfigChange`
    /// subscription (§4.1); this only handles the things the Supervisor can't
    /// do on its own — bringing up a brand-new printer, tearing one down, and
    /// rebinding a listener whose port or interface list changed.
    async fn reconcile_all(&self) {
        let config = self.config_store.get();
        let mut printers = self.printers.lock().await;

        let current_names: Vec<String> = config.printers.iter().map(|p| p.name.clone()).collect();

        let stale: Vec<String> = printers
            .keys()
            .filter(|name| !current_names.contains(name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(runtime) = printers.remove(&name) {
                Self::teardown(runtime).await;
            }
        }

        for printer_config in &config.printers {
            match printers.get(&printer_config.name) {
                None => {
                    let runtime = self.start_printer(printer_config, &config.listen_interfaces).await;
                    printers.insert(printer_config.name.clone(), runtime);
                }
                Some(existing)
                    if existing.bound_port != printer_config.listen_port
                        || existing.bound_interfaces != config.listen_interfaces =>
                {
                    let mut runtime = printers.remove(&printer_config.name).unwrap();
                    for listener in runtime.listeners.drain(..) {
                        listener.cancel.cancel();
                        let _ = listener.task.await;
                    }
                    runtime.listeners =
                        spawn_listeners(printer_config, &config.listen_interfaces, runtime.handle.clone());
                    runtime.bound_port = printer_config.listen_port;
                    runtime.bound_interfaces = config.listen_interfaces.clone();
                    printers.insert(printer_config.name.clone(), runtime);
                }
                Some(_) => {}
            }
        }
    }

    async fn start_printer(&self, config: &PrinterConfig, interfaces: &[String]) -> PrinterRuntime {
        let change_rx = self.config_store.subscribe();
        let (handle, supervisor_task) = supervisor::spawn(self.config_store.clone(), config.name.clone(), change_rx);
        let listeners = spawn_listeners(config, interfaces, handle.clone());
        tracing::info!(printer = %config.name, "printer supervisor started");
        PrinterRuntime {
            handle,
            supervisor_task,
            listeners,
            bound_port: config.listen_port,
            bound_interfaces: interfaces.to_vec(),
        }
    }

    async fn teardown(runtime: PrinterRuntime) {
        for listener in runtime.listeners {
            listener.cancel.cancel();
            let _ = listener.task.await;
        }
        runtime.handle.stop();
        let _ = runtime.supervisor_task.await;
    }

    /// Stops every Supervisor and listener. Called once on process shutdown.
    pub async fn shutdown(&self) {
        let mut printers = self.printers.lock().await;
        for (name, runtime) in printers.drain() {
            tracing::info!(printer = %name, "stopping printer supervisor");
            Self::teardown(runtime).await;
        }
    }
}

fn spawn_listeners(config: &PrinterConfig, interfaces: &[String], handle: SupervisorHandle) -> Vec<ListenerRuntime> {
    let mut listeners = Vec::new();
    for interface in interfaces {
        let ip: IpAddr = match interface.parse() {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(interface, "invalid listen_interfaces entry: {}", e);
                continue;
            }
        };
        let addr = SocketAddr::new(ip, config.listen_port);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_handle = handle.clone();
        let printer_name = config.name.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = web::serve(addr, task_handle, task_cancel).await {
                tracing::error!(printer = %printer_name, %addr, "HTTP listener exited: {}", e);
            }
        });
        listeners.push(ListenerRuntime { cancel, task });
    }
    if listeners.is_empty() {
        tracing::warn!(printer = %config.name, "no HTTP listener bound for printer");
    }
    listeners
}

//! IPC Server (§4.9) — a Unix-domain socket accepting one JSON command per
//! connection, dispatched against the [`Daemon`]. Grounded on the general
//! `tokio::net::UnixListener` accept-loop idiom (seen throughout the pack's
//! broker-style examples) and the teacher's `ConfigStore` subscribe/update
//! pattern for the commands that mutate configuration.

pub mod protocol;

use crate::daemon::Daemon;
use protocol::{Command, Envelope};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

/// Binds the IPC socket at `path`, removing a stale socket file first, and
/// serves connections until `cancel` fires.
pub async fn serve(
    path: PathBuf,
    daemon: Arc<Daemon>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
) -> crate::Result<()> {
    if path.exists() {
        tracing::warn!(path = %path.display(), "removing stale IPC socket");
        let _ = std::fs::remove_file(&path);
    }

    let listener = UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    tracing::info!(path = %path.display(), "IPC server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let daemon = daemon.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, daemon, shutdown).await {
                                tracing::warn!("IPC connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("IPC accept failed: {}", e),
                }
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    daemon: Arc<Daemon>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let envelope = match serde_json::from_str::<Command>(line.trim_end()) {
        Ok(command) => dispatch(command, &daemon, &shutdown).await,
        Err(e) => Envelope::err(format!("malformed command: {e}")),
    };

    let mut response = serde_json::to_vec(&envelope).unwrap_or_default();
    response.push(b'\n');
    writer.write_all(&response).await?;
    writer.shutdown().await?;
    Ok(())
}

async fn dispatch(command: Command, daemon: &Arc<Daemon>, shutdown: &CancellationToken) -> Envelope {
    match command {
        Command::GetStatus { name } => match daemon.status_for(&name).await {
            Some(status) => Envelope::ok(status),
            None => Envelope::err(format!("no such printer '{name}'")),
        },
        Command::ListPrinters => Envelope::ok(daemon.list_status().await),
        Command::GetPrinterDetails { name } => match daemon.status_for(&name).await {
            Some(status) => Envelope::ok(status),
            None => Envelope::err(format!("no such printer '{name}'")),
        },
        Command::GetPrinterConfig { name } => {
            let config = daemon
                .config_store
                .get()
                .printers
                .iter()
                .find(|p| p.name == name)
                .cloned();
            match config {
                Some(config) => Envelope::ok(config),
                None => Envelope::err(format!("no such printer '{name}'")),
            }
        }
        Command::AddPrinter { config } => match daemon.add_printer(config).await {
            Ok(()) => Envelope::ok_empty(),
            Err(e) => Envelope::err(e.to_string()),
        },
        Command::DeletePrinter { name } => match daemon.delete_printer(&name).await {
            Ok(()) => Envelope::ok_empty(),
            Err(e) => Envelope::err(e.to_string()),
        },
        Command::ModifyPrinter { name, config } => match daemon.modify_printer(&name, config).await {
            Ok(()) => Envelope::ok_empty(),
            Err(e) => Envelope::err(e.to_string()),
        },
        Command::PausePrinter { name } => match daemon.handle_for(&name).await {
            Some(handle) => {
                handle.pause().await;
                Envelope::ok_empty()
            }
            None => Envelope::err(format!("no such printer '{name}'")),
        },
        Command::ResumePrinter { name } => match daemon.handle_for(&name).await {
            Some(handle) => {
                handle.resume().await;
                Envelope::ok_empty()
            }
            None => Envelope::err(format!("no such printer '{name}'")),
        },
        Command::SetLed { name, on, brightness } => match daemon.handle_for(&name).await {
            Some(handle) => match handle.set_led(on, brightness).await {
                Ok(()) => Envelope::ok_empty(),
                Err(e) => Envelope::err(e.to_string()),
            },
            None => Envelope::err(format!("no such printer '{name}'")),
        },
        Command::ChangeInterfaces { interfaces } => {
            match daemon.config_store.set_listen_interfaces(interfaces).await {
                Ok(()) => Envelope::ok_empty(),
                Err(e) => Envelope::err(e.to_string()),
            }
        }
        Command::ReloadConfig => match daemon.config_store.reload().await {
            Ok(()) => Envelope::ok_empty(),
            Err(e) => Envelope::err(e.to_string()),
        },
        Command::StopService => {
            shutdown.cancel();
            Envelope::ok_empty()
        }
    }
}

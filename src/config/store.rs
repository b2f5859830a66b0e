use arc_swap::ArcSwap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{AppConfig, PrinterConfig};
use crate::error::{AppError, Result};

/// Configuration store backed by an atomically-replaced JSON file.
///
/// Uses `ArcSwap` for lock-free reads, providing high performance for frequent
/// configuration access in hot paths (mirrors the teacher's `ConfigStore`, with
/// the SQLite backing swapped for a flat file per §4.8).
#[derive(Clone)]
pub struct ConfigStore {
    path: Arc<PathBuf>,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event. `printer` is set when the change is scoped to a
/// single printer (add/delete/modify); `None` means a global change such as
/// `set_listen_interfaces` or a full reload.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub printer: Option<String>,
}

impl ConfigStore {
    /// Load (or create) the config file at `path`.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let config = Self::load_from_disk(path).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: Arc::new(path.to_path_buf()),
            cache,
            change_tx,
        })
    }

    async fn load_from_disk(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::persist(path, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic replace: write to a sibling temp file, fsync it, rename over the
    /// target, then fsync the parent directory. Guarantees the on-disk file is
    /// either fully the old or fully the new version even across a crash (§8
    /// property 5).
    async fn persist(path: &Path, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_vec_pretty(config)?;
        let tmp_path = path.with_extension("json.tmp");

        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        tmp.write_all(&json).await?;
        tmp.sync_all().await?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, path).await?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = tokio::fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }

        Ok(())
    }

    /// Get the current configuration (lock-free, zero-copy).
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the whole configuration document.
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        Self::persist(&self.path, &config).await?;
        self.cache.store(Arc::new(config));
        let _ = self.change_tx.send(ConfigChange { printer: None });
        Ok(())
    }

    /// Read-modify-write helper. Last write wins under concurrent callers;
    /// acceptable since config mutations are infrequent and IPC-serialized
    /// (§5 "Config mutations are serialized through the Config Store").
    async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig) -> Result<()>,
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config)?;
        Self::persist(&self.path, &config).await?;
        self.cache.store(Arc::new(config));
        Ok(())
    }

    fn check_uniqueness(
        config: &AppConfig,
        new_printer: &PrinterConfig,
        exclude_name: Option<&str>,
    ) -> Result<()> {
        for p in &config.printers {
            if Some(p.name.as_str()) == exclude_name {
                continue;
            }
            if p.name.eq_ignore_ascii_case(&new_printer.name) {
                return Err(AppError::ConfigInvalid {
                    field: "name".into(),
                    message: format!("name '{}' already in use", new_printer.name),
                });
            }
            if p.listen_port == new_printer.listen_port {
                return Err(AppError::ConfigInvalid {
                    field: "listen_port".into(),
                    message: format!(
                        "port {} in use by '{}'",
                        new_printer.listen_port, p.name
                    ),
                });
            }
        }
        Ok(())
    }

    /// Add a new printer. Fails with `ConfigInvalid` on name/port collision
    /// (§8 property 4) and never mutates the store on failure.
    pub async fn add_printer(&self, printer: PrinterConfig) -> Result<()> {
        PrinterConfig::validate_name(&printer.name)?;
        PrinterConfig::validate_port(printer.listen_port)?;

        let snapshot = self.cache.load();
        Self::check_uniqueness(&snapshot, &printer, None)?;

        let name = printer.name.clone();
        self.update(move |c| {
            c.printers.push(printer);
            Ok(())
        })
        .await?;
        let _ = self.change_tx.send(ConfigChange {
            printer: Some(name),
        });
        Ok(())
    }

    pub async fn delete_printer(&self, name: &str) -> Result<()> {
        let existed = self.cache.load().printers.iter().any(|p| p.name == name);
        if !existed {
            return Err(AppError::ConfigInvalid {
                field: "name".into(),
                message: format!("no such printer '{name}'"),
            });
        }
        let name_owned = name.to_string();
        self.update(move |c| {
            c.printers.retain(|p| p.name != name_owned);
            Ok(())
        })
        .await?;
        let _ = self.change_tx.send(ConfigChange {
            printer: Some(name.to_string()),
        });
        Ok(())
    }

    /// Replace the printer named `original_name` with `new_config`. Uniqueness
    /// is validated against every *other* printer.
    pub async fn modify_printer(
        &self,
        original_name: &str,
        new_config: PrinterConfig,
    ) -> Result<()> {
        PrinterConfig::validate_name(&new_config.name)?;
        PrinterConfig::validate_port(new_config.listen_port)?;

        let snapshot = self.cache.load();
        if !snapshot.printers.iter().any(|p| p.name == original_name) {
            return Err(AppError::ConfigInvalid {
                field: "name".into(),
                message: format!("no such printer '{original_name}'"),
            });
        }
        Self::check_uniqueness(&snapshot, &new_config, Some(original_name))?;

        let original_name_owned = original_name.to_string();
        let new_name = new_config.name.clone();
        self.update(move |c| {
            if let Some(slot) = c.printers.iter_mut().find(|p| p.name == original_name_owned) {
                *slot = new_config;
            }
            Ok(())
        })
        .await?;
        let _ = self.change_tx.send(ConfigChange {
            printer: Some(new_name),
        });
        Ok(())
    }

    /// Persist learned-once fields (`device_id`, `device_type`, `model_code`)
    /// discovered by the Credential Acquirer / Control Channel.
    pub async fn record_learned_fields(
        &self,
        name: &str,
        device_id: Option<String>,
        device_type: Option<String>,
        model_code: Option<String>,
    ) -> Result<()> {
        let name_owned = name.to_string();
        self.update(move |c| {
            if let Some(p) = c.printers.iter_mut().find(|p| p.name == name_owned) {
                if device_id.is_some() {
                    p.device_id = device_id;
                }
                if device_type.is_some() {
                    p.device_type = device_type;
                }
                if model_code.is_some() {
                    p.model_code = model_code;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn set_listen_interfaces(&self, interfaces: Vec<String>) -> Result<()> {
        if interfaces.is_empty() {
            return Err(AppError::ConfigInvalid {
                field: "listen_interfaces".into(),
                message: "at least one listen interface is required".into(),
            });
        }
        self.update(move |c| {
            c.listen_interfaces = interfaces;
            Ok(())
        })
        .await?;
        let _ = self.change_tx.send(ConfigChange { printer: None });
        Ok(())
    }

    /// Subscribe to configuration changes (used by the Daemon to reconcile
    /// Supervisors per §4.8).
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    /// Re-read the config file from disk, discarding the in-memory cache, and
    /// broadcast a global change so the Daemon reconciles against whatever an
    /// operator edited by hand (`reload_config` IPC command, §4.9).
    pub async fn reload(&self) -> Result<()> {
        let config = Self::load_from_disk(&self.path).await?;
        self.cache.store(Arc::new(config));
        let _ = self.change_tx.send(ConfigChange { printer: None });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn printer(name: &str, port: u16) -> PrinterConfig {
        PrinterConfig {
            name: name.to_string(),
            host: "10.0.0.10".to_string(),
            listen_port: port,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn persists_across_store_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let store = ConfigStore::new(&path).await.unwrap();
        store.add_printer(printer("p1", 8080)).await.unwrap();

        let store2 = ConfigStore::new(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.printers.len(), 1);
        assert_eq!(config.printers[0].name, "p1");
    }

    #[tokio::test]
    async fn rejects_duplicate_name_case_insensitive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path).await.unwrap();

        store.add_printer(printer("p1", 8080)).await.unwrap();
        let err = store.add_printer(printer("P1", 8081)).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigInvalid { field, .. } if field == "name"));
        assert_eq!(store.get().printers.len(), 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_port() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path).await.unwrap();

        store.add_printer(printer("p1", 8080)).await.unwrap();
        let err = store.add_printer(printer("p2", 8080)).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigInvalid { field, .. } if field == "listen_port"));
        assert_eq!(store.get().printers.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_printer_and_notifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path).await.unwrap();
        let mut rx = store.subscribe();

        store.add_printer(printer("p1", 8080)).await.unwrap();
        let _ = rx.recv().await.unwrap();

        store.delete_printer("p1").await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.printer.as_deref(), Some("p1"));
        assert!(store.get().printers.is_empty());
    }

    #[tokio::test]
    async fn modify_validates_uniqueness_against_others() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path).await.unwrap();

        store.add_printer(printer("p1", 8080)).await.unwrap();
        store.add_printer(printer("p2", 8081)).await.unwrap();

        let err = store
            .modify_printer("p2", printer("p2", 8080))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigInvalid { field, .. } if field == "listen_port"));
    }
}

//! Configuration file watcher for hot reload.
//!
//! Reloads on file changes and on SIGHUP. Every configuration that loads
//! and validates is forwarded to the reload channel; invalid files are
//! logged and the running configuration is kept.

use crate::config::{Config, load_config};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Configuration file watcher.
pub struct ConfigWatcher {
    /// Path to the config file.
    config_path: PathBuf,
    /// Receives every successfully reloaded configuration.
    reloads: mpsc::Sender<Config>,
}

impl ConfigWatcher {
    pub fn new(config_path: PathBuf, reloads: mpsc::Sender<Config>) -> Self {
        Self {
            config_path,
            reloads,
        }
    }

    /// Get the path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Run until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(path = %self.config_path.display(), "config watcher starting");

        let (tx, mut events) = mpsc::unbounded_channel();
        let watcher: Result<RecommendedWatcher, _> =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            });

        // Keep the watcher alive for the lifetime of the loop.
        let _watcher = match watcher {
            Ok(mut w) => {
                let dir = self
                    .config_path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                match w.watch(dir, RecursiveMode::NonRecursive) {
                    Ok(()) => Some(w),
                    Err(e) => {
                        error!(error = %e, "failed to watch config directory");
                        None
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to create file watcher");
                None
            }
        };

        #[cfg(unix)]
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "failed to setup SIGHUP handler");
                    None
                }
            };

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if self.should_reload(&event) {
                        self.try_reload().await;
                    }
                }

                _ = async {
                    #[cfg(unix)]
                    {
                        match sighup.as_mut() {
                            Some(sig) => sig.recv().await,
                            None => std::future::pending::<Option<()>>().await,
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("received SIGHUP, reloading configuration");
                    self.try_reload().await;
                }

                _ = shutdown.recv() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }

    /// Check if this event should trigger a reload.
    fn should_reload(&self, event: &Event) -> bool {
        let is_our_file = event
            .paths
            .iter()
            .any(|p| p.file_name() == self.config_path.file_name());

        let is_modify_or_create = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));

        is_our_file && is_modify_or_create
    }

    async fn try_reload(&self) {
        let config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to reload config, keeping current");
                return;
            }
        };

        info!(
            vip_ranges = config.node.vip_ranges.len(),
            services = config.services.len(),
            "configuration reloaded"
        );
        if self.reloads.send(config).await.is_err() {
            warn!("reload receiver dropped, ignoring new configuration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn watcher(path: &str) -> (ConfigWatcher, mpsc::Receiver<Config>) {
        let (tx, rx) = mpsc::channel(1);
        (ConfigWatcher::new(PathBuf::from(path), tx), rx)
    }

    fn modify(path: &str) -> Event {
        Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Content,
            )),
            paths: vec![PathBuf::from(path)],
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_should_reload_modify() {
        let (watcher, _rx) = watcher("/etc/l4plane/config.yaml");
        assert!(watcher.should_reload(&modify("/etc/l4plane/config.yaml")));
    }

    #[test]
    fn test_should_reload_wrong_file() {
        let (watcher, _rx) = watcher("/etc/l4plane/config.yaml");
        assert!(!watcher.should_reload(&modify("/etc/l4plane/other.yaml")));
    }

    #[test]
    fn test_should_reload_delete_ignored() {
        let (watcher, _rx) = watcher("/etc/l4plane/config.yaml");
        let event = Event {
            kind: EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![PathBuf::from("/etc/l4plane/config.yaml")],
            attrs: Default::default(),
        };
        assert!(!watcher.should_reload(&event));
    }

    #[tokio::test]
    async fn test_try_reload_forwards_valid_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"node:\n  interface: eth3\n").unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let watcher = ConfigWatcher::new(file.path().to_path_buf(), tx);
        watcher.try_reload().await;

        let config = rx.recv().await.unwrap();
        assert_eq!(config.node.interface, "eth3");
    }

    #[tokio::test]
    async fn test_try_reload_keeps_current_on_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"global:\n  log_level: loud\n").unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let watcher = ConfigWatcher::new(file.path().to_path_buf(), tx);
        watcher.try_reload().await;

        assert!(rx.try_recv().is_err());
    }
}

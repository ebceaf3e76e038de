//! Configuration file watcher for hot reload.
//!
//! Editors usually emit several notifications per save, so a reload is
//! only forwarded when the parsed file differs from the last one sent.
//! Overrides are not applied here; the engine layers its own on top of
//! every update it receives.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::EngineConfig;

/// Watches the configuration file and sends validated changes to the engine.
pub struct ConfigWatcher {
    filter: ReloadFilter,
    update_tx: mpsc::UnboundedSender<EngineConfig>,
}

impl ConfigWatcher {
    /// `current` is the configuration as last read from `path`, before any
    /// overrides.
    pub fn new(path: &Path, current: EngineConfig) -> (Self, mpsc::UnboundedReceiver<EngineConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                filter: ReloadFilter {
                    path: path.to_path_buf(),
                    last: current,
                },
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { mut filter, update_tx } = self;
        let path = filter.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    if let Some(next) = filter.on_change() {
                        if update_tx.send(next).is_err() {
                            tracing::debug!("Engine gone; dropping config update");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}

struct ReloadFilter {
    path: PathBuf,
    last: EngineConfig,
}

impl ReloadFilter {
    /// Re-read the file; `Some` only for a valid config that differs from
    /// the last one forwarded.
    fn on_change(&mut self) -> Option<EngineConfig> {
        match load_config(&self.path) {
            Ok(next) if next == self.last => {
                tracing::debug!(path = ?self.path, "Config file touched without changes");
                None
            }
            Ok(next) => {
                tracing::info!(path = ?self.path, "Config file changed");
                self.last = next.clone();
                Some(next)
            }
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Config reload rejected; keeping current settings");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_changed_valid_files_are_forwarded() {
        let path = std::env::temp_dir().join("proxy_health_watcher_test.toml");
        std::fs::write(&path, "[cache]\nttl_secs = 30\n").unwrap();
        let mut filter = ReloadFilter {
            path: path.clone(),
            last: load_config(&path).unwrap(),
        };

        assert!(filter.on_change().is_none());

        std::fs::write(&path, "[cache]\nttl_secs = 0\n").unwrap();
        assert!(filter.on_change().is_none());

        std::fs::write(&path, "[cache]\nttl_secs = 45\n").unwrap();
        assert_eq!(filter.on_change().map(|c| c.cache.ttl_secs), Some(45));
        assert!(filter.on_change().is_none());

        std::fs::remove_file(&path).unwrap_or_default();
    }
}

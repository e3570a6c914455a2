//! Registry file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::registry::{load_registry, RegistryStore};

/// Watches the registry file and swaps new contents into the store.
pub struct RegistryWatcher {
    path: PathBuf,
    store: Arc<RegistryStore>,
}

impl RegistryWatcher {
    pub fn new(path: &Path, store: Arc<RegistryStore>) -> Self {
        Self {
            path: path.to_path_buf(),
            store,
        }
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let store = self.store;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(path = %path.display(), "Registry change detected, reloading");
                        match load_registry(&path) {
                            Ok(registry) => store.replace(registry),
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to reload registry, keeping current contents");
                            }
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Registry watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Registry watcher started");
        Ok(watcher)
    }
}

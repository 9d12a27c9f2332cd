//! File provider: one fragment file per source, hot reloaded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::loader::{load_fragment, ConfigError};
use crate::config::schema::FileProviderConfig;
use crate::reconcile::TopologyPublisher;

/// Publishes a fragment file under its source name.
pub struct FileProvider {
    source: String,
    path: PathBuf,
    publisher: TopologyPublisher,
}

impl FileProvider {
    pub fn new(config: &FileProviderConfig, publisher: TopologyPublisher) -> Self {
        Self {
            source: config.name.clone(),
            path: PathBuf::from(&config.path),
            publisher,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Read the file and publish it as this source's fragment.
    pub fn publish_current(&self) -> Result<(), ConfigError> {
        publish(&self.source, &self.path, &self.publisher)
    }

    /// Start watching the file in a background thread.
    ///
    /// The parent directory is watched so editors that replace the file
    /// are seen. A file that fails to parse keeps the last published
    /// fragment; a deleted file withdraws the source.
    pub fn watch(self) -> Result<RecommendedWatcher, notify::Error> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let Self {
            source,
            path,
            publisher,
        } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !ours {
                        return;
                    }
                    if event.kind.is_remove() && !path.exists() {
                        tracing::warn!(source = %source, path = ?path, "Fragment file removed, withdrawing source");
                        if publisher.remove(&source).is_err() {
                            tracing::debug!(source = %source, "Reconciler gone, dropping event");
                        }
                    } else if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(source = %source, "Fragment file change detected, reloading...");
                        if let Err(e) = publish(&source, &path, &publisher) {
                            tracing::error!(source = %source, error = %e, "Failed to reload fragment. Keeping current topology.");
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?watched, "Fragment watcher started");
        Ok(watcher)
    }
}

fn publish(source: &str, path: &Path, publisher: &TopologyPublisher) -> Result<(), ConfigError> {
    let fragment = load_fragment(path)?;
    tracing::debug!(
        source = %source,
        routers = fragment.routers.len(),
        services = fragment.services.len(),
        middlewares = fragment.middlewares.len(),
        "Fragment loaded"
    );
    if publisher.replace(source, fragment).is_err() {
        tracing::debug!(source = %source, "Reconciler gone, dropping fragment");
    }
    Ok(())
}

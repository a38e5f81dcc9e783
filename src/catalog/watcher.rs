//! Hot-reload watcher for the catalog file

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::ToolCatalog;
use crate::{Error, Result};

/// Quiet period after the last file event before reloading
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Reloads the catalog when its file changes
pub struct CatalogWatcher {
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl CatalogWatcher {
    /// Start watching the catalog's backing file
    ///
    /// A catalog without a backing file gets an inert watcher.
    pub fn start(catalog: Arc<ToolCatalog>, shutdown_rx: broadcast::Receiver<()>) -> Result<Self> {
        let Some(path) = catalog.path().map(Path::to_path_buf) else {
            info!("Catalog has no backing file, hot-reload disabled");
            return Ok(Self {
                _watcher: Mutex::new(None),
            });
        };

        let (event_tx, event_rx) = mpsc::channel(100);
        let watcher = Self::create_watcher(event_tx, &path)?;
        Self::spawn_reload_task(catalog, event_rx, shutdown_rx);

        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }

    fn create_watcher(event_tx: mpsc::Sender<()>, path: &Path) -> Result<RecommendedWatcher> {
        // Editors replace files on save, so watch the directory and filter by name
        let file_name = path.file_name().map(std::ffi::OsStr::to_os_string);
        let dir: PathBuf = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let is_relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(std::ffi::OsStr::to_os_string) == file_name);

                    if is_relevant {
                        debug!(paths = ?event.paths, kind = ?event.kind, "Catalog file change");
                        let _ = event_tx.try_send(());
                    }
                }
                Err(e) => {
                    error!(error = %e, "File watcher error");
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("Failed to create file watcher: {e}")))?;

        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(directory = %dir.display(), error = %e, "Failed to watch catalog directory");
        } else {
            info!(path = %path.display(), "Watching catalog for changes");
        }

        Ok(watcher)
    }

    fn spawn_reload_task(
        catalog: Arc<ToolCatalog>,
        mut event_rx: mpsc::Receiver<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let mut last_event: Option<Instant> = None;
            let mut interval = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                    }
                    _ = interval.tick() => {
                        if last_event.is_some_and(|last| last.elapsed() >= DEBOUNCE) {
                            last_event = None;
                            match catalog.reload() {
                                Ok(count) => info!(tools = count, "Catalog hot-reload complete"),
                                Err(e) => error!(error = %e, "Catalog hot-reload failed, keeping previous catalog"),
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Catalog watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inert_without_backing_file() {
        let (_tx, rx) = broadcast::channel(1);
        let catalog = Arc::new(ToolCatalog::empty());
        assert!(CatalogWatcher::start(catalog, rx).is_ok());
    }

    #[tokio::test]
    async fn test_reloads_after_file_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool_catalog.yaml");
        std::fs::write(&path, "tools: {}\n").unwrap();

        let catalog = Arc::new(ToolCatalog::load(&path).unwrap());
        let (tx, rx) = broadcast::channel(1);
        let _watcher = CatalogWatcher::start(Arc::clone(&catalog), rx).unwrap();

        std::fs::write(
            &path,
            "tools:\n  ping:\n    bindings:\n      - { mcp_server: netprobe, physical_tool: network.ping }\n",
        )
        .unwrap();

        let mut reloaded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if catalog.get_tool("ping").is_some() {
                reloaded = true;
                break;
            }
        }
        let _ = tx.send(());
        assert!(reloaded, "catalog was not reloaded after the file changed");
    }
}

//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini for efficient file change detection.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use sync_core::fs::is_syncable;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// File event from the watcher.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Path relative to vault root, `/`-separated
    pub path: String,
    pub kind: FileEventKind,
    /// Size after the change; zero for deletions
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// File watcher that monitors the vault directory.
pub struct FileWatcher {
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

/// Last seen mtime per relative path, to drop events that changed nothing.
type MtimeCache = Arc<Mutex<HashMap<String, SystemTime>>>;

impl FileWatcher {
    /// Watch `vault_path` recursively, coalescing OS events over `debounce`.
    pub fn new(vault_path: PathBuf, debounce: Duration) -> Result<Self> {
        // FSEvents on macOS reports canonical paths (/private/var/...).
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root = vault_path.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            debounce,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) = Self::process_event(&event.path, &root, &mtime_cache) {
                            if event_tx.send(file_event).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Map one changed path to a `FileEvent`, or `None` if it is not synced.
    fn process_event(path: &Path, vault_path: &Path, mtime_cache: &MtimeCache) -> Option<FileEvent> {
        let relative = path.strip_prefix(vault_path).ok()?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?
            .join("/");

        // Covers .sync/ and every other hidden file or directory.
        if !is_syncable(&relative) {
            return None;
        }

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => None,
            Ok(metadata) => {
                if let Ok(mtime) = metadata.modified() {
                    if cache.get(&relative) == Some(&mtime) {
                        return None;
                    }
                    cache.insert(relative.clone(), mtime);
                }
                debug!("File modified: {}", relative);
                Some(FileEvent {
                    path: relative,
                    kind: FileEventKind::Modified,
                    size: metadata.len(),
                })
            }
            Err(_) => {
                cache.remove(&relative);
                debug!("File deleted: {}", relative);
                Some(FileEvent {
                    path: relative,
                    kind: FileEventKind::Deleted,
                    size: 0,
                })
            }
        }
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }
}

//! Change detection for the reload supervisor.
//!
//! Two strategies share one polling interface: [`FileWatcher::poll`] is
//! called once per interval tick and reports at most one changed path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::ReloaderKind;
use crate::reload::signature::{Signature, WatchSet};
use crate::reload::ReloadError;

/// Interval polling of modification times.
pub struct StatWatcher {
    set: Arc<WatchSet>,
    signature: Signature,
}

impl StatWatcher {
    /// Capture the initial signature.
    pub fn new(set: WatchSet) -> Self {
        let signature = set.snapshot();
        tracing::debug!(files = signature.len(), "Stat reloader watching files");
        Self {
            set: Arc::new(set),
            signature,
        }
    }

    pub async fn poll(&mut self) -> Option<PathBuf> {
        let set = Arc::clone(&self.set);
        let current = match tokio::task::spawn_blocking(move || set.snapshot()).await {
            Ok(signature) => signature,
            Err(e) => {
                tracing::error!(error = %e, "Signature scan failed");
                return None;
            }
        };
        let changed = current.changed_from(&self.signature).map(Path::to_path_buf);
        self.signature = current;
        changed
    }
}

/// Filesystem events, buffered until the next tick.
pub struct NotifyWatcher {
    events: mpsc::UnboundedReceiver<PathBuf>,
    _watcher: RecommendedWatcher,
}

impl NotifyWatcher {
    pub fn new(set: WatchSet) -> Result<Self, ReloadError> {
        let (tx, events) = mpsc::unbounded_channel();
        let set = Arc::new(set);
        let filter = Arc::clone(&set);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        for path in event.paths {
                            if filter.contains(&path) {
                                let _ = tx.send(path);
                            }
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "Watch error"),
            },
            Config::default(),
        )?;

        // Editors often replace files, so single files are watched via their
        // parent directory.
        let mut watched = 0usize;
        for file in set.files() {
            if let Some(parent) = file.parent() {
                if parent.is_dir() {
                    watcher.watch(parent, RecursiveMode::NonRecursive)?;
                    watched += 1;
                }
            }
        }
        for dir in set.dirs() {
            if dir.is_dir() {
                watcher.watch(dir, RecursiveMode::Recursive)?;
                watched += 1;
            } else {
                tracing::warn!(path = %dir.display(), "Watch directory does not exist");
            }
        }

        tracing::debug!(watches = watched, "Notify reloader started");
        Ok(Self {
            events,
            _watcher: watcher,
        })
    }

    /// Drain buffered events; several events in one tick coalesce.
    pub fn poll(&mut self) -> Option<PathBuf> {
        let mut changed = None;
        while let Ok(path) = self.events.try_recv() {
            changed.get_or_insert(path);
        }
        changed
    }
}

/// The configured change detector.
pub enum FileWatcher {
    Stat(StatWatcher),
    Notify(NotifyWatcher),
}

impl FileWatcher {
    pub fn new(kind: ReloaderKind, set: WatchSet) -> Result<Self, ReloadError> {
        Ok(match kind {
            ReloaderKind::Stat => FileWatcher::Stat(StatWatcher::new(set)),
            ReloaderKind::Notify => FileWatcher::Notify(NotifyWatcher::new(set)?),
        })
    }

    pub fn kind(&self) -> ReloaderKind {
        match self {
            FileWatcher::Stat(_) => ReloaderKind::Stat,
            FileWatcher::Notify(_) => ReloaderKind::Notify,
        }
    }

    /// A path that changed since the previous poll, if any.
    pub async fn poll(&mut self) -> Option<PathBuf> {
        match self {
            FileWatcher::Stat(watcher) => watcher.poll().await,
            FileWatcher::Notify(watcher) => watcher.poll(),
        }
    }
}

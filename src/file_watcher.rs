//! Watch primitive: raw change events for paths in the shared root.
//!
//! Provides a [`FileWatcher`] backed by OS-native mechanisms (kqueue on
//! macOS, inotify on Linux) or by periodic polling, via the `notify`
//! crate. Events are consumed by the tracker's monitor loop, which takes
//! the receiver with [`FileWatcher::take_rx`] and blocks on it.
//!
//! The tracker talks to watchers only through [`WatchBackend`], so it can
//! run on a [`ManualBackend`] that never produces events.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, RecursiveMode, Watcher};

/// Raw event stream handed out by [`FileWatcher::take_rx`].
pub type EventReceiver = mpsc::Receiver<Result<Event, notify::Error>>;

/// What a raw event means for the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// A path appeared (new signal file, new endpoint directory).
    Create,
    /// Content or metadata changed; a watched file may have grown.
    Modify,
    /// A sync client moved a temporary into place, or a path was renamed.
    Rename,
    /// A path disappeared.
    Delete,
    /// Access and watcher-internal events. Ignored.
    Other,
}

/// One classified event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path reported by the backend.
    pub path: PathBuf,
    /// Classification.
    pub kind: FileEventKind,
}

/// Start/stop watching paths. The black-box half of the watch primitive.
pub trait WatchBackend: Send {
    /// Begin watching `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be watched.
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<()>;

    /// Stop watching `path`. Safe to call for paths that are not watched.
    fn unwatch(&mut self, path: &Path);
}

/// Non-blocking file system watcher.
///
/// Wraps a `notify` watcher with a channel-based event interface.
pub struct FileWatcher {
    watcher: Box<dyn Watcher + Send>,
    rx: Option<EventReceiver>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher").finish_non_exhaustive()
    }
}

impl FileWatcher {
    /// Create a native watcher with no active watches.
    ///
    /// # Errors
    ///
    /// Returns an error if inotify/kqueue cannot be set up, typically
    /// because the per-user watch limit is exhausted.
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("Failed to create native watcher")?;

        Ok(Self {
            watcher: Box::new(watcher),
            rx: Some(rx),
        })
    }

    /// Create a watcher that stats watched paths every `interval`.
    ///
    /// Slower than native events but reliable on folders whose content is
    /// rewritten by a sync client or mounted over the network.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll watcher cannot be created.
    pub fn new_poll(interval: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let config = notify::Config::default().with_poll_interval(interval);
        let watcher = notify::PollWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            config,
        )
        .context("Failed to create poll watcher")?;

        Ok(Self {
            watcher: Box::new(watcher),
            rx: Some(rx),
        })
    }

    /// Hand the event receiver to a monitor thread. `None` on the
    /// second call.
    pub fn take_rx(&mut self) -> Option<EventReceiver> {
        self.rx.take()
    }

    /// One [`FileEvent`] per path in `event`.
    pub fn classify_event(event: &Event) -> Vec<FileEvent> {
        let kind = Self::classify(&event.kind);
        event
            .paths
            .iter()
            .map(|p| FileEvent {
                path: p.clone(),
                kind,
            })
            .collect()
    }

    /// Renames are split from other modifications; the tracker treats
    /// them like creations.
    fn classify(kind: &notify::EventKind) -> FileEventKind {
        match kind {
            notify::EventKind::Create(_) => FileEventKind::Create,
            notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => FileEventKind::Rename,
            notify::EventKind::Modify(_) => FileEventKind::Modify,
            notify::EventKind::Remove(_) => FileEventKind::Delete,
            _ => FileEventKind::Other,
        }
    }
}

impl WatchBackend for FileWatcher {
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<()> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        self.watcher
            .watch(path, mode)
            .with_context(|| format!("Cannot watch {}", path.display()))?;

        log::debug!("Watching for file changes: {}", path.display());
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) {
        if let Err(e) = self.watcher.unwatch(path) {
            log::trace!("unwatch {}: {e}", path.display());
        }
    }
}

/// Backend that produces no events.
///
/// Used when changes are discovered exclusively by rescanning, and in tests
/// that simulate replication by driving the tracker by hand.
#[derive(Debug, Default)]
pub struct ManualBackend;

impl ManualBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

impl WatchBackend for ManualBackend {
    fn watch(&mut self, path: &Path, _recursive: bool) -> Result<()> {
        log::trace!("manual watch: {}", path.display());
        Ok(())
    }

    fn unwatch(&mut self, _path: &Path) {}
}

//! Change tracker: turns file system events into per-channel deltas.
//!
//! The tracker owns the registry of watched paths. Each entry carries a
//! [`Cursor`] and the endpoints subscribed to it. When a watched file
//! grows, the tracker reads exactly the bytes appended since the cursor
//! and hands them to the subscribers as a [`Notification`].
//!
//! # Architecture
//!
//! ```text
//! notify watcher ──► monitor thread ──► Tracker::handle_event
//!                        │ (timeout)            │
//!                        └──► Tracker::rescan ──┤
//!                                               ▼
//!                              stat + read delta (no registry lock)
//!                                               │
//!                              cursor update (registry write lock)
//!                                               │
//!                              Subscriber::on_notify (no lock)
//! ```
//!
//! One instance is built at process start ([`Tracker::start`]) and its
//! handle is cloned into every endpoint. Tests use [`Tracker::detached`]
//! and call [`Tracker::rescan`] to make pending writes "visible".

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{RecvError, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use crate::config::{Config, WatchMode};
use crate::file_watcher::{
    EventReceiver, FileEvent, FileEventKind, FileWatcher, ManualBackend, WatchBackend,
};
use crate::layout::Layout;

/// Last-seen state of a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// A file whose first `len` bytes have been delivered.
    File {
        /// Modification time at the last read.
        modified: SystemTime,
        /// Bytes consumed so far.
        len: u64,
    },
    /// A directory watched for new entries.
    Directory,
}

impl Cursor {
    /// Cursor of a file nothing has been read from yet.
    pub const ZERO: Self = Self::File {
        modified: UNIX_EPOCH,
        len: 0,
    };
}

/// Bytes appended to a watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Path segment directly under the shared root.
    pub channel_id: String,
    /// The file that grew.
    pub path: PathBuf,
    /// The appended bytes.
    pub delta: Vec<u8>,
}

/// Receiver of tracker notifications.
///
/// Called from the tracker's dispatch context with no tracker lock held,
/// so implementations may watch or unwatch paths.
pub trait Subscriber: Send + Sync {
    /// A subscribed file grew.
    fn on_notify(&self, notification: &Notification);

    /// A subscribed path was deleted and dropped from the registry.
    fn on_vanished(&self, _channel_id: &str, _path: &Path) {}
}

/// Weak handle stored in the registry.
pub type SubscriberRef = Weak<dyn Subscriber>;

struct Entry {
    cursor: Cursor,
    subscribers: Vec<SubscriberRef>,
    /// Watched directory this entry was discovered in. Such entries are
    /// covered by the directory's OS watch instead of their own.
    parent: Option<PathBuf>,
}

impl Entry {
    fn subscribe(&mut self, subscriber: SubscriberRef) {
        if !self.subscribers.iter().any(|s| Weak::ptr_eq(s, &subscriber)) {
            self.subscribers.push(subscriber);
        }
    }
}

struct Registry {
    entries: HashMap<PathBuf, Entry>,
    /// Only touched through `&mut Registry`; the mutex makes the backend
    /// shareable without requiring `Sync` from it.
    backend: Mutex<Box<dyn WatchBackend>>,
}

impl Registry {
    /// Removes `path` (and, for directories, its discovered children),
    /// stopping the OS watch. Returns the removed entry.
    fn remove(&mut self, path: &Path) -> Option<Entry> {
        let entry = self.entries.remove(path)?;
        if entry.parent.is_none() {
            self.backend().unwatch(path);
        }
        if entry.cursor == Cursor::Directory {
            self.entries
                .retain(|_, child| child.parent.as_deref() != Some(path));
        }
        Some(entry)
    }

    fn backend(&mut self) -> &mut dyn WatchBackend {
        self.backend
            .get_mut()
            .expect("Watch backend mutex poisoned")
            .as_mut()
    }
}

struct TrackerInner {
    config: Config,
    layout: Layout,
    registry: RwLock<Registry>,
    /// Serializes delta extraction and delivery so the deltas of one file
    /// reach subscribers in append order.
    dispatch: Mutex<()>,
}

/// Shared handle to the process-wide change tracker.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("root", &self.inner.layout.root())
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Build a tracker with an OS watch backend and spawn its monitor
    /// thread.
    ///
    /// The thread drains watcher events and, if configured, rescans on
    /// [`Config::rescan_interval`]. It exits once every handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created, the watcher cannot
    /// be initialized, or the thread cannot be spawned.
    pub fn start(config: Config) -> Result<Self> {
        let mut watcher = match config.watch_mode {
            WatchMode::Native => FileWatcher::new()?,
            WatchMode::Poll => FileWatcher::new_poll(config.poll_interval())?,
        };
        let rx = watcher.take_rx().context("Watcher receiver already taken")?;
        let rescan_interval = config.rescan_interval();

        let tracker = Self::with_backend(config, Box::new(watcher))?;
        let weak = Arc::downgrade(&tracker.inner);

        thread::Builder::new()
            .name("foldersock-monitor".to_string())
            .spawn(move || monitor_loop(&rx, &weak, rescan_interval))
            .context("Failed to spawn monitor thread")?;

        log::info!("Tracker started on {}", tracker.layout().root().display());
        Ok(tracker)
    }

    /// Build a tracker that never sees OS events.
    ///
    /// Changes are only picked up by [`rescan`](Self::rescan) and
    /// [`handle_event`](Self::handle_event).
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created.
    pub fn detached(config: Config) -> Result<Self> {
        Self::with_backend(config, Box::new(ManualBackend::new()))
    }

    /// Build a tracker on an arbitrary backend. No thread is spawned.
    ///
    /// The root is created if missing and canonicalized so paths reported
    /// by the OS compare equal to the paths endpoints construct.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created.
    pub fn with_backend(mut config: Config, backend: Box<dyn WatchBackend>) -> Result<Self> {
        fs::create_dir_all(&config.root)
            .with_context(|| format!("Failed to create root: {}", config.root.display()))?;
        if let Ok(canonical) = fs::canonicalize(&config.root) {
            config.root = canonical;
        }

        Ok(Self {
            inner: Arc::new(TrackerInner {
                layout: Layout::new(config.root.clone()),
                config,
                registry: RwLock::new(Registry {
                    entries: HashMap::new(),
                    backend: Mutex::new(backend),
                }),
                dispatch: Mutex::new(()),
            }),
        })
    }

    /// Configuration this tracker runs with (root canonicalized).
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Layout of the shared root.
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Watch a directory for new child files.
    ///
    /// Children that appear later are registered from offset zero and
    /// their whole content is delivered as the first delta.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS watch cannot be established.
    pub fn watch_directory(&self, path: &Path, subscriber: SubscriberRef) -> Result<()> {
        let mut registry = self.write_registry();
        if let Some(entry) = registry.entries.get_mut(path) {
            entry.subscribe(subscriber);
            return Ok(());
        }

        registry.backend().watch(path, false)?;
        registry.entries.insert(
            path.to_path_buf(),
            Entry {
                cursor: Cursor::Directory,
                subscribers: vec![subscriber],
                parent: None,
            },
        );
        log::info!("add_dir: {}", path.display());
        Ok(())
    }

    /// Watch a file for growth, starting from its current length.
    ///
    /// If the path is already registered only the subscriber is added.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be stat'ed or watched.
    pub fn watch_file(&self, path: &Path, subscriber: SubscriberRef) -> Result<()> {
        let meta = fs::metadata(path)
            .with_context(|| format!("Failed to stat: {}", path.display()))?;
        let cursor = Cursor::File {
            modified: meta.modified().unwrap_or(UNIX_EPOCH),
            len: meta.len(),
        };

        let mut registry = self.write_registry();
        if let Some(entry) = registry.entries.get_mut(path) {
            entry.subscribe(subscriber);
            return Ok(());
        }

        registry.backend().watch(path, false)?;
        registry.entries.insert(
            path.to_path_buf(),
            Entry {
                cursor,
                subscribers: vec![subscriber],
                parent: None,
            },
        );
        log::info!("add_file: {}", path.display());
        Ok(())
    }

    /// Drop `subscriber` from `path`. The entry is removed once nobody is
    /// subscribed to it.
    pub fn unwatch_file(&self, path: &Path, subscriber: &SubscriberRef) {
        let mut registry = self.write_registry();
        let Some(entry) = registry.entries.get_mut(path) else {
            return;
        };
        entry
            .subscribers
            .retain(|s| !Weak::ptr_eq(s, subscriber) && s.strong_count() > 0);
        if entry.subscribers.is_empty() {
            registry.remove(path);
            log::info!("remove_file: {}", path.display());
        }
    }

    /// Drop `path` from the registry regardless of subscribers.
    pub fn unwatch(&self, path: &Path) {
        if self.write_registry().remove(path).is_some() {
            log::info!("remove_file: {}", path.display());
        }
    }

    /// Whether `path` is in the registry.
    pub fn is_watching(&self, path: &Path) -> bool {
        self.read_registry().entries.contains_key(path)
    }

    /// Cursor of `path`, if registered.
    pub fn cursor(&self, path: &Path) -> Option<Cursor> {
        self.read_registry().entries.get(path).map(|e| e.cursor)
    }

    /// Every registered path, sorted.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.read_registry().entries.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Process one raw event from the watch primitive.
    pub fn handle_event(&self, event: &FileEvent) {
        let _dispatch = self.lock_dispatch();
        self.handle_event_locked(event);
    }

    /// Check `path` for growth and deliver any new bytes.
    pub fn handle_change(&self, path: &Path) {
        let _dispatch = self.lock_dispatch();
        self.extract_and_deliver(path);
    }

    /// Sweep every watched directory for unknown children and every
    /// watched file for growth.
    ///
    /// Must not be called from inside a [`Subscriber`] callback.
    pub fn rescan(&self) {
        let _dispatch = self.lock_dispatch();

        let (dirs, files): (Vec<_>, Vec<_>) = {
            let registry = self.read_registry();
            registry
                .entries
                .iter()
                .map(|(path, entry)| (path.clone(), entry.cursor))
                .partition(|(_, cursor)| *cursor == Cursor::Directory)
        };

        for (dir, _) in dirs {
            self.scan_directory(&dir);
        }
        for (file, _) in files {
            self.extract_and_deliver(&file);
        }
    }

    fn handle_event_locked(&self, event: &FileEvent) {
        let path = event.path.as_path();
        match event.kind {
            FileEventKind::Other => return,
            FileEventKind::Delete => {
                self.handle_removal(path);
                return;
            }
            FileEventKind::Create | FileEventKind::Modify | FileEventKind::Rename => {}
        }

        match self.cursor(path) {
            Some(Cursor::Directory) => self.scan_directory(path),
            Some(Cursor::File { .. }) => self.extract_and_deliver(path),
            None => {
                let Some(parent) = path.parent() else {
                    return;
                };
                if self.cursor(parent) == Some(Cursor::Directory) && path.is_file() {
                    self.discover_child(parent, path);
                    self.extract_and_deliver(path);
                }
            }
        }
    }

    /// A remove event is only a vanish if the path is really gone. Sync
    /// clients replace files by renaming a temporary over them, which
    /// kills the OS watch but leaves a (longer) file behind.
    fn handle_removal(&self, path: &Path) {
        match fs::symlink_metadata(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.vanish(path),
            Err(e) => log::warn!("Could not stat {}: {e}", path.display()),
            Ok(_) => {
                log::debug!("{} was replaced, re-watching", path.display());
                self.rewatch(path);
                match self.cursor(path) {
                    Some(Cursor::Directory) => self.scan_directory(path),
                    Some(Cursor::File { .. }) => self.extract_and_deliver(path),
                    None => {}
                }
            }
        }
    }

    /// Renew the OS watch of a top-level entry.
    fn rewatch(&self, path: &Path) {
        let mut registry = self.write_registry();
        let own_watch = registry
            .entries
            .get(path)
            .is_some_and(|entry| entry.parent.is_none());
        if !own_watch {
            return;
        }
        let backend = registry.backend();
        backend.unwatch(path);
        if let Err(e) = backend.watch(path, false) {
            log::warn!("{e:#}");
        }
    }

    /// List `dir` and deliver every child not yet registered.
    fn scan_directory(&self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.vanish(dir);
                return;
            }
            Err(e) => {
                log::warn!("Could not list {}: {e}", dir.display());
                return;
            }
        };

        let mut children: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        children.sort();

        for child in children {
            if self.discover_child(dir, &child) {
                self.extract_and_deliver(&child);
            }
        }
    }

    /// Register `child` of watched directory `dir` with the zero cursor.
    ///
    /// Returns `false` if the child is already registered or ignored.
    fn discover_child(&self, dir: &Path, child: &Path) -> bool {
        let hidden = child
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with('.'));
        if hidden {
            log::trace!("Ignoring hidden file {}", child.display());
            return false;
        }

        let mut registry = self.write_registry();
        if registry.entries.contains_key(child) {
            return false;
        }
        let Some(subscribers) = registry.entries.get(dir).map(|e| e.subscribers.clone()) else {
            return false;
        };
        registry.entries.insert(
            child.to_path_buf(),
            Entry {
                cursor: Cursor::ZERO,
                subscribers,
                parent: Some(dir.to_path_buf()),
            },
        );
        log::info!("dir modified {}", child.display());
        true
    }

    /// Read the bytes appended to `path` since its cursor, advance the
    /// cursor, and deliver them.
    fn extract_and_deliver(&self, path: &Path) {
        let (previous, subscribers) = {
            let registry = self.read_registry();
            match registry.entries.get(path) {
                Some(Entry {
                    cursor: Cursor::File { modified, len },
                    subscribers,
                    ..
                }) => ((*modified, *len), subscribers.clone()),
                _ => return,
            }
        };

        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.vanish(path);
                return;
            }
            Err(e) => {
                log::warn!("Could not stat {}: {e}", path.display());
                return;
            }
        };

        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        let new_len = meta.len();
        if (modified, new_len) == previous {
            return;
        }

        let start = if new_len < previous.1 {
            log::warn!(
                "{} shrank from {} to {} bytes, re-reading from the start",
                path.display(),
                previous.1,
                new_len
            );
            0
        } else {
            previous.1
        };

        let delta = match read_range(path, start, new_len - start) {
            Ok(delta) => delta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.vanish(path);
                return;
            }
            Err(e) => {
                log::warn!("Could not read {}: {e}", path.display());
                return;
            }
        };

        // Advance before delivery so a failing consumer never sees the
        // same bytes twice.
        self.set_cursor(
            path,
            Cursor::File {
                modified,
                len: start + delta.len() as u64,
            },
        );

        if delta.is_empty() {
            return;
        }

        let Some(channel_id) = self.layout().channel_id(path) else {
            log::warn!("{} is outside the shared root", path.display());
            return;
        };
        log::debug!("data: {} bytes from {}", delta.len(), path.display());

        let notification = Notification {
            channel_id,
            path: path.to_path_buf(),
            delta,
        };
        let mut dead = false;
        for subscriber in &subscribers {
            match subscriber.upgrade() {
                Some(subscriber) => {
                    deliver(path, || subscriber.on_notify(&notification));
                }
                None => dead = true,
            }
        }
        if dead {
            self.prune(path);
        }
    }

    /// Drop a path that disappeared and tell its subscribers.
    fn vanish(&self, path: &Path) {
        let Some(entry) = self.write_registry().remove(path) else {
            return;
        };
        log::debug!("file_deleted: {}", path.display());

        let channel_id = self.layout().channel_id(path).unwrap_or_default();
        for subscriber in entry.subscribers.iter().filter_map(Weak::upgrade) {
            deliver(path, || subscriber.on_vanished(&channel_id, path));
        }
    }

    fn set_cursor(&self, path: &Path, cursor: Cursor) {
        if let Some(entry) = self.write_registry().entries.get_mut(path) {
            entry.cursor = cursor;
        }
    }

    fn prune(&self, path: &Path) {
        let mut registry = self.write_registry();
        let Some(entry) = registry.entries.get_mut(path) else {
            return;
        };
        entry.subscribers.retain(|s| s.strong_count() > 0);
        if entry.subscribers.is_empty() {
            registry.remove(path);
            log::debug!("Dropped unsubscribed path {}", path.display());
        }
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.registry.read().expect("Tracker registry lock poisoned")
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.registry.write().expect("Tracker registry lock poisoned")
    }

    fn lock_dispatch(&self) -> std::sync::MutexGuard<'_, ()> {
        // Guards no data, so a poisoned lock is still usable.
        self.inner
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run one subscriber callback. A panicking subscriber is logged and
/// skipped so the other subscribers and later events are unaffected.
fn deliver(path: &Path, callback: impl FnOnce()) {
    if let Err(panic_info) = catch_unwind(AssertUnwindSafe(callback)) {
        let msg = panic_info
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| panic_info.downcast_ref::<&str>().copied())
            .unwrap_or("unknown panic");
        log::error!("Subscriber panicked handling {}: {msg}", path.display());
    }
}

/// Read `len` bytes of `path` starting at `offset`.
///
/// Returns fewer bytes if the file was truncated in between.
fn read_range(path: &Path, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
    file.take(len).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Body of the monitor thread.
fn monitor_loop(rx: &EventReceiver, tracker: &Weak<TrackerInner>, rescan: Option<Duration>) {
    let mut last_rescan = Instant::now();

    loop {
        let received = match rescan {
            Some(interval) => rx.recv_timeout(interval.saturating_sub(last_rescan.elapsed())),
            None => rx.recv().map_err(|RecvError| RecvTimeoutError::Disconnected),
        };

        let Some(inner) = tracker.upgrade() else {
            break;
        };
        let tracker = Tracker { inner };

        match received {
            Ok(Ok(event)) => {
                for event in FileWatcher::classify_event(&event) {
                    log::trace!("Modified: {}", event.path.display());
                    tracker.handle_event(&event);
                }
            }
            Ok(Err(e)) => log::warn!("File watcher error: {e}"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if rescan.is_some_and(|interval| last_rescan.elapsed() >= interval) {
            tracker.rescan();
            last_rescan = Instant::now();
        }
    }

    log::debug!("Monitor thread exiting");
}

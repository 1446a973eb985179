//! Channel endpoints: the socket-like public surface.
//!
//! An endpoint owns `<root>/<id>/data` (its outbox) and
//! `<root>/<id>/controls/` (where peers leave signal files). Connecting is
//! a two-step handshake carried over signal files:
//!
//! ```text
//! A.connect(B)
//!   A: touch <root>/B/controls/A, append "HELLO A"      A: GreetingSent
//!   B: sees HELLO, watches <root>/A/data,
//!      touch <root>/A/controls/B, append "OK B"         B: Greeted
//!   A: sees OK, watches <root>/B/data                   A: Connected
//! A.send("ping")
//!   A: append frame to <root>/A/data
//!   B: sees growth, receive callback ("A", "ping")      B: Connected
//! ```
//!
//! Every peer relationship is an independent leg keyed by the peer id, so
//! one endpoint can serve several peers and a `BYE` only closes its own
//! leg. Tokens are only honoured when they arrive through the signal file
//! named after the peer they mention.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::SettleConfig;
use crate::constants::{ID_SEPARATOR, MAX_PENDING_MESSAGES};
use crate::error::SocketError;
use crate::frame::{append_frame, FrameDecoder};
use crate::layout::{self, is_valid_id, Layout};
use crate::protocol::{Control, LegState};
use crate::tracker::{Notification, Subscriber, SubscriberRef, Tracker};

/// Callback for application payloads: `(source_id, text)`.
pub type ReceiveCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Callback fired when a leg we initiated becomes connected:
/// `(endpoint, peer_id)`.
pub type ConnectedCallback = Arc<dyn Fn(&Endpoint, &str) + Send + Sync>;

/// One peer id or a collection of them.
pub trait IntoPeers {
    /// The peer ids in order.
    fn into_peers(self) -> Vec<String>;
}

impl IntoPeers for &str {
    fn into_peers(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoPeers for String {
    fn into_peers(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoPeers for &String {
    fn into_peers(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl<S: Into<String>> IntoPeers for Vec<S> {
    fn into_peers(self) -> Vec<String> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<S: Into<String>, const N: usize> IntoPeers for [S; N] {
    fn into_peers(self) -> Vec<String> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<S: Into<String> + Clone> IntoPeers for &[S] {
    fn into_peers(self) -> Vec<String> {
        self.iter().cloned().map(Into::into).collect()
    }
}

/// Generate `<hostname>_<pid>_<sequence>`.
fn generate_id() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
        .replace(|c: char| c.is_whitespace() || std::path::is_separator(c), "-");
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);

    format!(
        "{host}{ID_SEPARATOR}{}{ID_SEPARATOR}{seq}",
        std::process::id()
    )
}

/// Per-peer bookkeeping.
#[derive(Debug)]
struct Leg {
    state: LegState,
    /// Signal file we write into the peer's `controls/`.
    signal: Option<PathBuf>,
    /// Whether the peer's outbox is registered with the tracker for us.
    data_watched: bool,
}

impl Leg {
    fn new(state: LegState) -> Self {
        Self {
            state,
            signal: None,
            data_watched: false,
        }
    }
}

#[derive(Debug, Default)]
struct EndpointState {
    legs: HashMap<String, Leg>,
    /// Line reassembly per source file.
    decoders: HashMap<PathBuf, FrameDecoder>,
    /// Payloads that arrived before a receive callback was registered.
    pending: Vec<(String, String)>,
    closed: bool,
}

struct EndpointInner {
    id: String,
    tracker: Tracker,
    layout: Layout,
    settle: SettleConfig,
    state: Mutex<EndpointState>,
    on_receive: Mutex<Option<ReceiveCallback>>,
    on_connected: Option<ConnectedCallback>,
    self_ref: Weak<EndpointInner>,
}

/// Handle to a channel endpoint. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Non-owning handle to an [`Endpoint`].
///
/// Callbacks registered on an endpoint should capture this instead of an
/// [`Endpoint`] clone, which would keep the endpoint alive forever.
#[derive(Clone, Debug)]
pub struct WeakEndpoint {
    inner: Weak<EndpointInner>,
}

impl WeakEndpoint {
    /// The endpoint, unless every [`Endpoint`] handle was dropped.
    pub fn upgrade(&self) -> Option<Endpoint> {
        self.inner.upgrade().map(|inner| Endpoint { inner })
    }
}

/// Builder for [`Endpoint`].
#[derive(Default)]
pub struct EndpointBuilder {
    id: Option<String>,
    on_connected: Option<ConnectedCallback>,
}

impl std::fmt::Debug for EndpointBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointBuilder")
            .field("id", &self.id)
            .field("has_on_connected", &self.on_connected.is_some())
            .finish()
    }
}

impl EndpointBuilder {
    /// Use a fixed id instead of `<hostname>_<pid>_<sequence>`.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Callback fired each time a leg this endpoint initiated connects.
    #[must_use]
    pub fn on_connected(mut self, callback: impl Fn(&Endpoint, &str) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(callback));
        self
    }

    /// Create the endpoint's directory tree and start watching its
    /// `controls/` directory.
    ///
    /// # Errors
    ///
    /// - [`SocketError::InvalidIdentity`] if the id is not a usable path segment.
    /// - [`SocketError::DuplicateIdentity`] if `<root>/<id>` already exists.
    /// - [`SocketError::StorageUnavailable`] if the tree cannot be created.
    pub fn build(self, tracker: &Tracker) -> Result<Endpoint, SocketError> {
        let id = self.id.unwrap_or_else(generate_id);
        if !is_valid_id(&id) {
            return Err(SocketError::InvalidIdentity(id));
        }

        let layout = tracker.layout().clone();
        layout.ensure_root().map_err(|e| {
            SocketError::StorageUnavailable(format!("{}: {e}", layout.root().display()))
        })?;

        let dir = layout.endpoint_dir(&id);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(SocketError::DuplicateIdentity(id));
            }
            Err(e) => {
                return Err(SocketError::StorageUnavailable(format!("{}: {e}", dir.display())));
            }
        }

        let controls = layout.controls_dir(&id);
        let bootstrap = fs::create_dir(&controls)
            .and_then(|()| layout::touch(&layout.data_file(&id)))
            .map_err(|e| SocketError::StorageUnavailable(format!("{}: {e}", dir.display())));
        if let Err(e) = bootstrap {
            layout::remove_dir_quietly(&dir);
            return Err(e);
        }

        let inner = Arc::new_cyclic(|self_ref| EndpointInner {
            id,
            tracker: tracker.clone(),
            layout,
            settle: tracker.config().settle,
            state: Mutex::new(EndpointState::default()),
            on_receive: Mutex::new(None),
            on_connected: self.on_connected,
            self_ref: Weak::clone(self_ref),
        });

        if let Err(e) = tracker.watch_directory(&controls, inner.subscriber_ref()) {
            layout::remove_dir_quietly(&dir);
            return Err(SocketError::StorageUnavailable(format!("{e:#}")));
        }

        log::info!("Endpoint {} ready at {}", inner.id, dir.display());
        Ok(Endpoint { inner })
    }
}

impl Endpoint {
    /// Start building an endpoint.
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::default()
    }

    /// Create a fresh, unconnected endpoint with a generated id.
    ///
    /// # Errors
    ///
    /// See [`EndpointBuilder::build`].
    pub fn create(tracker: &Tracker) -> Result<Self, SocketError> {
        Self::builder().build(tracker)
    }

    /// Create an endpoint and immediately greet `peers`.
    ///
    /// `on_connected` fires once per peer that answers; it typically
    /// registers the receive callback on the handle it is given.
    ///
    /// # Errors
    ///
    /// See [`EndpointBuilder::build`].
    pub fn open(
        tracker: &Tracker,
        peers: impl IntoPeers,
        on_connected: impl Fn(&Endpoint, &str) + Send + Sync + 'static,
    ) -> Result<Self, SocketError> {
        let endpoint = Self::builder().on_connected(on_connected).build(tracker)?;
        endpoint.connect(peers)?;
        Ok(endpoint)
    }

    /// A handle that does not keep the endpoint alive.
    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// This endpoint's identity.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Path of this endpoint's outbox.
    pub fn data_path(&self) -> PathBuf {
        self.inner.layout.data_file(&self.inner.id)
    }

    /// Greet one or more peers. Returns without waiting for their answer.
    ///
    /// Peers whose `controls/` directory does not become visible within
    /// the settle backoff are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the endpoint was closed.
    pub fn connect(&self, peers: impl IntoPeers) -> Result<(), SocketError> {
        self.connect_all(peers.into_peers())
    }

    /// Greet every peer yielded by `peers`.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the endpoint was closed.
    pub fn connect_all<I, S>(&self, peers: I) -> Result<(), SocketError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for peer in peers {
            self.inner.connect_one(&peer.into())?;
        }
        Ok(())
    }

    /// Append `text` as one frame to this endpoint's outbox.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the endpoint was closed, or
    /// [`SocketError::StorageUnavailable`] if the outbox cannot be written.
    pub fn send(&self, text: &str) -> Result<(), SocketError> {
        if self.is_closed() {
            log::error!("send on closed endpoint {}", self.inner.id);
            return Err(SocketError::Closed);
        }
        let path = self.data_path();
        append_frame(&path, text)
            .map_err(|e| SocketError::StorageUnavailable(format!("{}: {e}", path.display())))
    }

    /// Register the callback for application payloads.
    ///
    /// Payloads that arrived before any callback was registered are
    /// delivered immediately, in arrival order.
    pub fn on_receive(&self, callback: impl Fn(&str, &str) + Send + Sync + 'static) {
        let callback: ReceiveCallback = Arc::new(callback);
        let pending = {
            let mut state = self.inner.lock_state();
            *self
                .inner
                .on_receive
                .lock()
                .expect("Receive callback mutex poisoned") = Some(Arc::clone(&callback));
            std::mem::take(&mut state.pending)
        };

        for (source, text) in pending {
            callback(&source, &text);
        }
    }

    /// Say `BYE` to every peer and remove this endpoint's files.
    ///
    /// Idempotent. Never fails: anything that cannot be removed is logged.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// State of the leg to `peer`, or `None` if there never was one.
    pub fn leg_state(&self, peer: &str) -> Option<LegState> {
        self.inner.lock_state().legs.get(peer).map(|leg| leg.state)
    }

    /// Peers with a leg that is not closed, sorted.
    pub fn peers(&self) -> Vec<String> {
        let state = self.inner.lock_state();
        let mut peers: Vec<_> = state
            .legs
            .iter()
            .filter(|(_, leg)| leg.state != LegState::Closed)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }
}

impl EndpointInner {
    fn subscriber_ref(&self) -> SubscriberRef {
        Weak::<EndpointInner>::clone(&self.self_ref)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.state.lock().expect("Endpoint state mutex poisoned")
    }

    fn handle(&self) -> Option<Endpoint> {
        self.self_ref.upgrade().map(|inner| Endpoint { inner })
    }

    fn connect_one(&self, peer: &str) -> Result<(), SocketError> {
        {
            let state = self.lock_state();
            if state.closed {
                return Err(SocketError::Closed);
            }
            if let Some(leg) = state.legs.get(peer) {
                if leg.state != LegState::Closed {
                    log::debug!("{}: leg to {peer} already {:?}", self.id, leg.state);
                    return Ok(());
                }
            }
        }
        if peer == self.id || !is_valid_id(peer) {
            log::warn!("{}: refusing to connect to {peer:?}", self.id);
            return Ok(());
        }

        if !self.settle.wait_for(&self.layout.controls_dir(peer)) {
            log::warn!("{}: {}", self.id, SocketError::PeerVanished(peer.to_string()));
            return Ok(());
        }

        let signal = self.layout.signal_file(peer, &self.id);
        if let Err(e) = write_token(&signal, &Control::Hello(self.id.clone())) {
            log::warn!("{}: could not greet {peer}: {e}", self.id);
            return Ok(());
        }

        let mut state = self.lock_state();
        if state.closed {
            drop(state);
            layout::remove_file_quietly(&signal);
            return Err(SocketError::Closed);
        }
        let leg = state
            .legs
            .entry(peer.to_string())
            .or_insert_with(|| Leg::new(LegState::GreetingSent));
        leg.state = LegState::GreetingSent;
        leg.signal = Some(signal);
        log::info!("{}: greeting sent to {peer}", self.id);
        Ok(())
    }

    fn handle_notification(&self, notification: &Notification) {
        let texts = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            let decoder = state.decoders.entry(notification.path.clone()).or_default();
            let mut texts = Vec::new();
            for frame in decoder.feed(&notification.delta) {
                match frame.and_then(|f| f.text()) {
                    Ok(text) => texts.push(text),
                    Err(e) => log::warn!(
                        "{}: {e} (from {})",
                        self.id,
                        notification.path.display()
                    ),
                }
            }
            texts
        };

        let path = notification.path.as_path();
        if let Some(writer) = self.layout.signal_writer(&self.id, path) {
            for text in texts {
                self.handle_control(&writer, &text);
            }
        } else if let Some(owner) = self.layout.data_owner(path) {
            for text in texts {
                self.handle_payload(&owner, text);
            }
        } else {
            log::debug!("{}: ignoring delta from {}", self.id, path.display());
        }
    }

    fn handle_control(&self, writer: &str, text: &str) {
        let Some(token) = Control::parse(text) else {
            log::warn!("{}: unexpected text in signal file of {writer}: {text:?}", self.id);
            return;
        };
        if token.peer() != writer {
            log::warn!("{}: {token} arrived through the signal file of {writer}, ignoring", self.id);
            return;
        }

        match token {
            Control::Hello(peer) => self.on_hello(&peer),
            Control::Ok(peer) => self.on_ok(&peer),
            Control::Bye(peer) => {
                log::info!("{}: got BYE from {peer}", self.id);
                self.release_peer(&peer);
            }
        }
    }

    fn on_hello(&self, peer: &str) {
        log::info!("{}: got HELLO from {peer}", self.id);
        {
            let state = self.lock_state();
            if state.closed {
                return;
            }
            if let Some(leg) = state.legs.get(peer) {
                if matches!(leg.state, LegState::Greeted | LegState::Connected) {
                    log::debug!("{}: duplicate HELLO from {peer}", self.id);
                    return;
                }
            }
        }

        let data = self.layout.data_file(peer);
        if !self.settle.wait_for(&data) {
            log::warn!("{}: {}", self.id, SocketError::PeerVanished(peer.to_string()));
            return;
        }
        if let Err(e) = self.tracker.watch_file(&data, self.subscriber_ref()) {
            log::warn!("{}: cannot watch outbox of {peer}: {e:#}", self.id);
            return;
        }

        let signal = self.layout.signal_file(peer, &self.id);
        if let Err(e) = write_token(&signal, &Control::Ok(self.id.clone())) {
            log::warn!("{}: could not answer {peer}: {e}", self.id);
            self.tracker.unwatch_file(&data, &self.subscriber_ref());
            return;
        }

        self.record_answer(peer, signal);
    }

    /// Store the leg of an answered greeting. If the endpoint was closed
    /// meanwhile, undo the watch and the signal file instead.
    fn record_answer(&self, peer: &str, signal: PathBuf) {
        let mut state = self.lock_state();
        if state.closed {
            drop(state);
            self.tracker
                .unwatch_file(&self.layout.data_file(peer), &self.subscriber_ref());
            layout::remove_file_quietly(&signal);
            return;
        }
        let leg = state
            .legs
            .entry(peer.to_string())
            .or_insert_with(|| Leg::new(LegState::Greeted));
        // Crossed greetings: we still wait for the peer's OK to our HELLO.
        if leg.state != LegState::GreetingSent {
            leg.state = LegState::Greeted;
        }
        leg.signal = Some(signal);
        leg.data_watched = true;
    }

    fn on_ok(&self, peer: &str) {
        log::info!("{}: got OK from {peer}", self.id);
        let data_watched = {
            let state = self.lock_state();
            match state.legs.get(peer) {
                Some(leg) if leg.state == LegState::GreetingSent => leg.data_watched,
                other => {
                    log::warn!(
                        "{}: OK from {peer} without a pending greeting ({:?}), ignoring",
                        self.id,
                        other.map(|leg| leg.state)
                    );
                    return;
                }
            }
        };

        let data = self.layout.data_file(peer);
        if !data_watched {
            let watched = self.settle.wait_for(&data)
                && self
                    .tracker
                    .watch_file(&data, self.subscriber_ref())
                    .map_err(|e| log::warn!("{}: cannot watch outbox of {peer}: {e:#}", self.id))
                    .is_ok();
            if !watched {
                log::warn!("{}: {}", self.id, SocketError::PeerVanished(peer.to_string()));
                if let Some(leg) = self.lock_state().legs.get_mut(peer) {
                    leg.state = LegState::Closed;
                }
                return;
            }
        }

        let connected = match self.lock_state().legs.get_mut(peer) {
            Some(leg) if leg.state == LegState::GreetingSent => {
                leg.state = LegState::Connected;
                leg.data_watched = true;
                true
            }
            _ => false,
        };
        if !connected {
            // Closed while we were setting up the watch.
            self.tracker.unwatch_file(&data, &self.subscriber_ref());
            return;
        }
        log::info!("{}: connected to {peer}", self.id);

        if let (Some(callback), Some(endpoint)) = (self.on_connected.clone(), self.handle()) {
            callback(&endpoint, peer);
        }
    }

    fn handle_payload(&self, source: &str, text: String) {
        let callback = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            match state.legs.get_mut(source) {
                Some(leg) if leg.state.accepts_data() => leg.state = LegState::Connected,
                _ => {
                    log::debug!("{}: ignoring data from {source}: no open leg", self.id);
                    return;
                }
            }
            let registered = self
                .on_receive
                .lock()
                .expect("Receive callback mutex poisoned")
                .clone();
            match registered {
                Some(callback) => callback,
                None => {
                    if state.pending.len() < MAX_PENDING_MESSAGES {
                        state.pending.push((source.to_string(), text));
                    } else {
                        log::warn!(
                            "{}: no receive callback, dropping payload from {source}",
                            self.id
                        );
                    }
                    return;
                }
            }
        };

        callback(source, &text);
    }

    /// Close the leg to `peer` and stop watching its outbox.
    fn release_peer(&self, peer: &str) {
        let data = self.layout.data_file(peer);
        let was_watched = {
            let mut state = self.lock_state();
            let Some(leg) = state.legs.get_mut(peer) else {
                log::debug!("{}: no leg to release for {peer}", self.id);
                return;
            };
            if leg.state == LegState::Closed {
                return;
            }
            leg.state = LegState::Closed;
            let was_watched = std::mem::take(&mut leg.data_watched);
            if state.decoders.remove(&data).is_some_and(|d| d.has_partial()) {
                log::debug!("{}: discarding unterminated line from {peer}", self.id);
            }
            was_watched
        };

        if was_watched {
            self.tracker.unwatch_file(&data, &self.subscriber_ref());
        }
        log::info!("{}: leg to {peer} closed", self.id);
    }

    fn close(&self) {
        let (signals, watched) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.decoders.clear();
            state.pending.clear();

            let mut signals = Vec::new();
            let mut watched = Vec::new();
            for (peer, leg) in &mut state.legs {
                leg.state = LegState::Closed;
                signals.extend(leg.signal.take());
                if std::mem::take(&mut leg.data_watched) {
                    watched.push(self.layout.data_file(peer));
                }
            }
            (signals, watched)
        };
        *self
            .on_receive
            .lock()
            .expect("Receive callback mutex poisoned") = None;

        let bye = Control::Bye(self.id.clone());
        for signal in &signals {
            // Never recreate a signal file the peer already cleaned up.
            if signal.is_file() {
                if let Err(e) = write_token(signal, &bye) {
                    log::debug!("{}: could not send BYE via {}: {e}", self.id, signal.display());
                }
            }
            layout::remove_file_quietly(signal);
        }

        let subscriber = self.subscriber_ref();
        for data in &watched {
            self.tracker.unwatch_file(data, &subscriber);
        }
        self.tracker.unwatch(&self.layout.controls_dir(&self.id));

        layout::remove_file_quietly(&self.layout.data_file(&self.id));
        layout::remove_dir_quietly(&self.layout.endpoint_dir(&self.id));
        log::info!("Endpoint {} closed", self.id);
    }
}

impl Subscriber for EndpointInner {
    fn on_notify(&self, notification: &Notification) {
        self.handle_notification(notification);
    }

    fn on_vanished(&self, _channel_id: &str, path: &Path) {
        let peer = self
            .layout
            .data_owner(path)
            .filter(|owner| *owner != self.id)
            .or_else(|| self.layout.signal_writer(&self.id, path));

        match peer {
            Some(peer) => {
                log::info!("{}: {}", self.id, SocketError::PeerVanished(peer.clone()));
                self.release_peer(&peer);
            }
            None if path == self.layout.controls_dir(&self.id) && !self.lock_state().closed => {
                log::warn!("{}: own controls directory disappeared", self.id);
            }
            None => {}
        }
    }
}

/// Create `path` if needed and append one token frame.
fn write_token(path: &Path, token: &Control) -> io::Result<()> {
    layout::touch(path)?;
    append_frame(path, &token.to_string())
}

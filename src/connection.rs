//! Connection lifecycle
//!
//! One `Connection` per session owns the transport handle and turns the
//! transport's event stream into host-visible events. Every event handler
//! re-locates the session by id before touching any state: the callbacks
//! run on the transport's task, and the call may have ended while an event
//! was in flight. A missing session is a silent no-op, never an error.
//!
//! The connection outlives ordinary teardown: at cleanup its `Arc` is moved
//! into a detached task so a slow transport close cannot block the caller.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::control;
use crate::events::{EventKind, EventSink, MediaSink};
use crate::protocol;
use crate::session::{SessionRegistry, StreamSession};
use crate::transport::{ConnectOptions, Transport, TransportEvent, WsTransport};

/// Lifecycle of one connection instance. `Error` and `Closed` are both
/// terminal; they differ in the event surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

pub struct Connection {
    session_id: String,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    suppress_log: bool,
    initial_metadata: Option<String>,
    temp_dir: PathBuf,
    /// Every file written for a control command, for cleanup
    temp_files: Mutex<HashSet<PathBuf>>,
    registry: Arc<SessionRegistry>,
    events: Arc<dyn EventSink>,
    media: Arc<dyn MediaSink>,
}

impl Connection {
    /// Connect to the session's configured endpoint and start dispatching
    /// transport events. Returns immediately; the handshake completes in
    /// the background and surfaces as a `connect` or `error` event.
    pub fn open(
        session: &StreamSession,
        registry: Arc<SessionRegistry>,
        events: Arc<dyn EventSink>,
        media: Arc<dyn MediaSink>,
    ) -> Arc<Self> {
        let config = session.config();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = WsTransport::connect(
            config.ws_uri.clone(),
            ConnectOptions {
                headers: config.parse_extra_headers(),
                tls: config.tls.clone(),
                ping_interval: config
                    .heartbeat_secs
                    .map(std::time::Duration::from_secs),
                deflate: config.deflate,
            },
            tx,
        );
        Self::attach(session, transport, rx, registry, events, media)
    }

    /// Wire an already-created transport to the dispatch loop.
    ///
    /// Split out of `open` so tests can drive a connection with a mock
    /// transport and a hand-fed event stream.
    pub fn attach(
        session: &StreamSession,
        transport: Arc<dyn Transport>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        registry: Arc<SessionRegistry>,
        events: Arc<dyn EventSink>,
        media: Arc<dyn MediaSink>,
    ) -> Arc<Self> {
        let config = session.config();
        let connection = Arc::new(Self {
            session_id: session.id().to_string(),
            transport,
            state: Mutex::new(ConnectionState::Connecting),
            suppress_log: config.suppress_log,
            initial_metadata: config.metadata.clone(),
            temp_dir: config.temp_dir.clone(),
            temp_files: Mutex::new(HashSet::new()),
            registry,
            events,
            media,
        });

        let dispatcher = Arc::clone(&connection);
        tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                dispatcher.handle_event(event).await;
            }
            log::debug!("({}) transport event stream ended", dispatcher.session_id);
        });

        connection
    }

    /// Dispatch one transport event. Public so tests can drive the
    /// lifecycle without a live socket.
    pub async fn handle_event(&self, event: TransportEvent) {
        // The call may have ended while this event was queued
        let Some(session) = self.registry.locate(&self.session_id) else {
            return;
        };

        match event {
            TransportEvent::Open => {
                self.set_state(ConnectionState::Open);
                if let Some(metadata) = &self.initial_metadata {
                    if !metadata.is_empty() {
                        log::debug!("({}) sending initial metadata", self.session_id);
                        self.write_text(metadata);
                    }
                }
                self.events.notify(
                    &self.session_id,
                    EventKind::Connect,
                    &protocol::connected_payload(),
                );
            }
            TransportEvent::Error { code, message } => {
                self.set_state(ConnectionState::Errored);
                log::info!("({}) connection error: {}", self.session_id, message);
                self.events.notify(
                    &self.session_id,
                    EventKind::Error,
                    &protocol::error_payload(code, &message),
                );
                // Teardown stays with the host; we only ask for the hook
                self.media.detach_requested(&self.session_id);
            }
            TransportEvent::Closed { code, reason } => {
                self.set_state(ConnectionState::Closed);
                log::info!("({}) connection closed", self.session_id);
                self.events.notify(
                    &self.session_id,
                    EventKind::Disconnect,
                    &protocol::disconnected_payload(code, &reason),
                );
            }
            TransportEvent::Message(text) => {
                let mut text = text;
                let handled = control::process_message(self, &session, &mut text).await;
                if !handled {
                    self.events.notify(&self.session_id, EventKind::Json, &text);
                }
                if !self.suppress_log {
                    log::debug!("({}) response: {}", self.session_id, text);
                }
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Errored)
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Send a text frame; silently dropped when the socket is not open.
    pub fn write_text(&self, text: &str) {
        if !self.transport.is_connected() {
            return;
        }
        if let Err(e) = self.transport.send_text(text) {
            log::debug!("({}) text send failed: {}", self.session_id, e);
        }
    }

    /// Send a binary frame; silently dropped when the socket is not open.
    pub fn write_binary(&self, data: Vec<u8>) {
        if !self.transport.is_connected() {
            return;
        }
        if let Err(e) = self.transport.send_binary(data) {
            log::debug!("({}) binary send failed: {}", self.session_id, e);
        }
    }

    /// Idempotent; safe to call from a detached teardown task.
    pub fn disconnect(&self) {
        log::debug!("({}) disconnecting", self.session_id);
        self.set_state(ConnectionState::Closing);
        self.transport.disconnect();
    }

    pub(crate) fn notify(&self, kind: EventKind, payload: &str) {
        self.events.notify(&self.session_id, kind, payload);
    }

    pub(crate) fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub(crate) fn record_temp_file(&self, path: PathBuf) {
        if let Ok(mut files) = self.temp_files.lock() {
            files.insert(path);
        }
    }

    /// Paths of every file written for this connection, for tests and
    /// host-side bookkeeping.
    pub fn temp_file_paths(&self) -> Vec<PathBuf> {
        self.temp_files
            .lock()
            .map(|files| files.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every file this connection created. Safe to call repeatedly.
    pub fn delete_files(&self) {
        let Ok(mut files) = self.temp_files.lock() else {
            return;
        };
        for path in files.drain() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!(
                    "({}) failed to remove {}: {}",
                    self.session_id,
                    path.display(),
                    e
                ),
            }
        }
    }
}

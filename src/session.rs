//! Per-call session record and the registry behind callback re-entry
//!
//! A `StreamSession` holds everything one bridged call owns: the two ring
//! buffers, the per-direction converters, the connection slot and the
//! write-task handle. The `SessionRegistry` is the weak-reference pattern
//! every transport callback goes through: callbacks never hold a raw
//! reference into a session, they re-locate it by id and treat "not found"
//! as a silent no-op because the call may have ended mid-flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::buffer::{BufferInitError, RingBuffer};
use crate::config::{validate_ws_uri, SessionConfig};
use crate::connection::Connection;
use crate::resampler::{Resampler, ResamplerInitError};

/// Fatal session setup failure; no handle is returned to the host and all
/// partially created resources are dropped.
#[derive(Debug)]
pub enum SetupError {
    InvalidUri(String),
    Buffer(BufferInitError),
    Resampler(ResamplerInitError),
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::InvalidUri(uri) => write!(f, "invalid websocket uri: {}", uri),
            SetupError::Buffer(e) => write!(f, "buffer setup failed: {}", e),
            SetupError::Resampler(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SetupError {}

impl From<BufferInitError> for SetupError {
    fn from(e: BufferInitError) -> Self {
        SetupError::Buffer(e)
    }
}

impl From<ResamplerInitError> for SetupError {
    fn from(e: ResamplerInitError) -> Self {
        SetupError::Resampler(e)
    }
}

/// State shared by the three actors of one bridged call.
pub struct StreamSession {
    id: String,
    config: SessionConfig,
    paused: AtomicBool,
    /// Set-once teardown flag; every loop polls it at iteration boundaries
    close_requested: AtomicBool,
    /// Monotonic counter naming control-command temp files
    file_counter: AtomicU32,
    /// Media -> socket direction
    pub(crate) ingest_buffer: Mutex<RingBuffer>,
    /// Socket -> media direction
    pub(crate) emit_buffer: Mutex<RingBuffer>,
    /// media rate -> transport rate; `None` when the rates match
    pub(crate) ingest_resampler: Option<Mutex<Resampler>>,
    /// transport rate -> media rate; `None` when the rates match
    pub(crate) emit_resampler: Option<Mutex<Resampler>>,
    pub(crate) connection: Mutex<Option<Arc<Connection>>>,
    pub(crate) write_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    /// Create the session record, its buffers and converters.
    ///
    /// Rates and channel count are frozen here. Any failure is fatal to
    /// setup; nothing is registered and everything built so far is dropped.
    pub fn new(id: String, config: SessionConfig) -> Result<Arc<Self>, SetupError> {
        if !validate_ws_uri(&config.ws_uri) {
            return Err(SetupError::InvalidUri(config.ws_uri.clone()));
        }

        let capacity = config.buffer_capacity();
        let ingest_buffer = RingBuffer::new(capacity)?;
        let emit_buffer = RingBuffer::new(capacity)?;

        let (ingest_resampler, emit_resampler) =
            if config.media_sample_rate == config.transport_sample_rate {
                log::debug!("({}) no resampling needed for this call", id);
                (None, None)
            } else {
                log::debug!(
                    "({}) resampling between {} and {}",
                    id,
                    config.media_sample_rate,
                    config.transport_sample_rate
                );
                let frames_in = SessionConfig::samples_per_frame(config.media_sample_rate);
                let frames_out = SessionConfig::samples_per_frame(config.transport_sample_rate);
                let ingest = Resampler::new(
                    config.media_sample_rate,
                    config.transport_sample_rate,
                    config.channels,
                    frames_in,
                )?;
                let emit = Resampler::new(
                    config.transport_sample_rate,
                    config.media_sample_rate,
                    config.channels,
                    frames_out,
                )?;
                (Some(Mutex::new(ingest)), Some(Mutex::new(emit)))
            };

        Ok(Arc::new(Self {
            id,
            config,
            paused: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            file_counter: AtomicU32::new(0),
            ingest_buffer: Mutex::new(ingest_buffer),
            emit_buffer: Mutex::new(emit_buffer),
            ingest_resampler,
            emit_resampler,
            connection: Mutex::new(None),
            write_task: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Monotonic: once requested, never cleared.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Next index for a control-command temp file name.
    pub fn next_file_index(&self) -> u32 {
        self.file_counter.fetch_add(1, Ordering::AcqRel)
    }

    /// Count of temp files produced so far.
    pub fn files_produced(&self) -> u32 {
        self.file_counter.load(Ordering::Acquire)
    }

    /// Current connection, if the session is attached to one.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Locate-by-id table of live sessions.
///
/// `locate` hands out a reference-counted borrow valid for the duration of
/// one callback; a missing id means the call already ended.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<StreamSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<StreamSession>) {
        if let Ok(mut map) = self.sessions.lock() {
            map.insert(session.id().to_string(), session);
        }
    }

    /// Remove and return the session, if it is still live.
    pub fn unregister(&self, id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.lock().ok()?.remove(id)
    }

    pub fn locate(&self, id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.lock().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SessionConfig {
        SessionConfig {
            ws_uri: "ws://localhost:8080/stream".to_string(),
            media_sample_rate: 8000,
            transport_sample_rate: 16000,
            channels: 1,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_setup_creates_converters_when_rates_differ() {
        let session = StreamSession::new("abc".to_string(), test_config()).unwrap();
        assert!(session.ingest_resampler.is_some());
        assert!(session.emit_resampler.is_some());
    }

    #[test]
    fn test_setup_skips_converters_for_equal_rates() {
        let mut config = test_config();
        config.transport_sample_rate = 8000;
        let session = StreamSession::new("abc".to_string(), config).unwrap();
        assert!(session.ingest_resampler.is_none());
        assert!(session.emit_resampler.is_none());
    }

    #[test]
    fn test_setup_rejects_bad_uri() {
        let mut config = test_config();
        config.ws_uri = "http://not-a-socket".to_string();
        assert!(matches!(
            StreamSession::new("abc".to_string(), config),
            Err(SetupError::InvalidUri(_))
        ));
    }

    #[test]
    fn test_close_requested_is_monotonic() {
        let session = StreamSession::new("abc".to_string(), test_config()).unwrap();
        assert!(!session.close_requested());
        session.request_close();
        session.request_close();
        assert!(session.close_requested());
    }

    #[test]
    fn test_file_counter_monotonic() {
        let session = StreamSession::new("abc".to_string(), test_config()).unwrap();
        assert_eq!(session.next_file_index(), 0);
        assert_eq!(session.next_file_index(), 1);
        assert_eq!(session.files_produced(), 2);
    }

    #[test]
    fn test_registry_locate_and_unregister() {
        let registry = SessionRegistry::new();
        let session = StreamSession::new("call-1".to_string(), test_config()).unwrap();
        registry.register(Arc::clone(&session));

        assert!(registry.locate("call-1").is_some());
        assert!(registry.locate("call-2").is_none());

        let removed = registry.unregister("call-1").unwrap();
        assert_eq!(removed.id(), "call-1");
        assert!(registry.locate("call-1").is_none());
        assert!(registry.unregister("call-1").is_none());
    }
}

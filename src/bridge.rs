//! Host-facing facade
//!
//! The `Bridge` owns the session registry and the two host sinks, and maps
//! the host's lifecycle calls onto them: set a session up, run its periodic
//! write task, feed it media frames, tear it down. The media path never
//! blocks; every lock it takes is a `try_lock`, and contention means one
//! frame of silence, not a stalled media thread.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::{SessionConfig, FRAME_INTERVAL_MS};
use crate::connection::Connection;
use crate::events::{EventSink, MediaSink};
use crate::resampler::{bytes_to_samples, samples_to_bytes};
use crate::session::{SessionRegistry, SetupError, StreamSession};
use crate::transport::{Transport, TransportEvent};

/// How long teardown waits for the write task to observe the close flag.
const WRITE_TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Bridge {
    registry: Arc<SessionRegistry>,
    events: Arc<dyn EventSink>,
    media: Arc<dyn MediaSink>,
}

impl Bridge {
    pub fn new(events: Arc<dyn EventSink>, media: Arc<dyn MediaSink>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            events,
            media,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Create a session and connect it to its configured endpoint.
    ///
    /// The session is locatable before the socket opens, so lifecycle
    /// events arriving mid-handshake find it. Setup failures return the
    /// error and leave nothing registered.
    pub fn initialize_session(
        &self,
        id: String,
        config: SessionConfig,
    ) -> Result<Arc<StreamSession>, SetupError> {
        let session = StreamSession::new(id, config)?;
        log::info!(
            "({}) streaming to {} ({} -> {} Hz, {} channel(s))",
            session.id(),
            session.config().ws_uri,
            session.config().media_sample_rate,
            session.config().transport_sample_rate,
            session.config().channels
        );
        self.registry.register(Arc::clone(&session));
        let connection = Connection::open(
            &session,
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            Arc::clone(&self.media),
        );
        store_connection(&session, connection);
        Ok(session)
    }

    /// Register a session over a transport the caller already created.
    ///
    /// Hosts that manage their own sockets use this instead of
    /// `initialize_session`; it is also the seam tests drive.
    pub fn attach_session(
        &self,
        session: Arc<StreamSession>,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Arc<Connection> {
        self.registry.register(Arc::clone(&session));
        let connection = Connection::attach(
            &session,
            transport,
            transport_events,
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            Arc::clone(&self.media),
        );
        store_connection(&session, Arc::clone(&connection));
        connection
    }

    /// Start the 20ms cadence task that moves emit-buffer audio into the
    /// call, one media frame per tick.
    pub fn start_write_task(&self, session: &Arc<StreamSession>) {
        let task_session = Arc::clone(session);
        let media = Arc::clone(&self.media);
        let handle = tokio::spawn(async move {
            let mut ticks =
                tokio::time::interval(Duration::from_millis(FRAME_INTERVAL_MS as u64));
            // A late tick must not cause a burst of frames
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if task_session.close_requested() {
                    break;
                }
                emit_media_frame(&task_session, media.as_ref());
            }
            log::debug!("({}) write task exiting", task_session.id());
        });

        if let Ok(mut slot) = session.write_task.lock() {
            *slot = Some(handle);
        }
    }

    /// Ingest one 20ms media frame from the call (media thread, every 20ms).
    ///
    /// Never blocks: converter or buffer contention drops this frame.
    /// Frames are discarded while paused, during teardown, or when the
    /// socket is not open.
    pub fn feed_frame(&self, session: &StreamSession, frame: &[u8]) {
        if session.is_paused() || session.close_requested() {
            return;
        }
        let Some(connection) = session.connection() else {
            return;
        };
        if !connection.is_connected() {
            return;
        }

        let data = match &session.ingest_resampler {
            Some(converter) => {
                let Ok(mut converter) = converter.try_lock() else {
                    log::debug!(
                        "({}) converter busy, dropping {} byte frame",
                        session.id(),
                        frame.len()
                    );
                    return;
                };
                samples_to_bytes(&converter.convert(&bytes_to_samples(frame)))
            }
            None => frame.to_vec(),
        };

        if session.config().batch_factor() == 1 {
            connection.write_binary(data);
            return;
        }

        let Ok(mut buffer) = session.ingest_buffer.try_lock() else {
            log::debug!(
                "({}) ingest buffer busy, dropping {} byte frame",
                session.id(),
                data.len()
            );
            return;
        };
        let mut offset = 0;
        while offset < data.len() {
            if buffer.free_space() == 0 {
                connection.write_binary(buffer.drain());
            }
            offset += buffer.write(&data[offset..]);
        }
        if buffer.is_full() {
            connection.write_binary(buffer.drain());
        }
    }

    /// Pause or resume the ingest direction. Emit-direction audio and
    /// control commands are unaffected.
    pub fn pause(&self, id: &str, paused: bool) -> bool {
        let Some(session) = self.registry.locate(id) else {
            return false;
        };
        log::debug!("({}) pause = {}", id, paused);
        session.set_paused(paused);
        true
    }

    /// Send an arbitrary text frame on a session's socket.
    pub fn send_text(&self, id: &str, text: &str) -> bool {
        let Some(session) = self.registry.locate(id) else {
            return false;
        };
        let Some(connection) = session.connection() else {
            return false;
        };
        connection.write_text(text);
        true
    }

    /// Tear a session down. Idempotent: a second call finds nothing in the
    /// registry and returns `false`.
    ///
    /// `final_text` is sent before the socket closes, if one is given and
    /// the socket is still open. The socket close itself runs detached so
    /// a slow remote endpoint cannot stall the caller.
    pub async fn cleanup(&self, id: &str, final_text: Option<&str>) -> bool {
        let Some(session) = self.registry.unregister(id) else {
            return false;
        };
        log::info!("({}) tearing down", id);
        session.request_close();

        // Detach the connection first: final text, file cleanup, then the
        // socket close on its own task
        let connection = session
            .connection
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(connection) = connection {
            if let Some(text) = final_text {
                connection.write_text(text);
            }
            connection.delete_files();
            // The remote end may take its time; do not make the caller wait
            tokio::spawn(async move {
                connection.disconnect();
            });
        }

        let write_task = session
            .write_task
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = write_task {
            if tokio::time::timeout(WRITE_TASK_JOIN_TIMEOUT, handle)
                .await
                .is_err()
            {
                log::warn!("({}) write task did not stop in time", id);
            }
        }
        true
    }
}

/// Move one frame of emit audio into the call, or nothing at all.
///
/// Runs on the write task's cadence. `try_lock` keeps the control handler
/// and this task from ever waiting on each other; a contended tick is
/// silence, which the engine fills on its own. The engine only accepts
/// whole frames, so a sub-frame residue stays buffered until enough audio
/// arrives to complete it.
fn emit_media_frame(session: &StreamSession, media: &dyn MediaSink) {
    let frame_bytes = session.config().media_frame_bytes();
    let Ok(mut buffer) = session.emit_buffer.try_lock() else {
        return;
    };
    if buffer.in_use() < frame_bytes {
        return;
    }
    let frame = buffer.read(frame_bytes);
    drop(buffer);
    media.deliver_frame(session.id(), &frame);
}

fn store_connection(session: &StreamSession, connection: Arc<Connection>) {
    if let Ok(mut slot) = session.connection.lock() {
        *slot = Some(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;
    use crate::events::EventKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct NullSink;

    impl EventSink for NullSink {
        fn notify(&self, _session_id: &str, _kind: EventKind, _payload: &str) {}
    }

    #[derive(Default)]
    struct FrameRecorder {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl MediaSink for FrameRecorder {
        fn deliver_frame(&self, _session_id: &str, frame: &[u8]) {
            self.frames.lock().unwrap().push(frame.to_vec());
        }
        fn detach_requested(&self, _session_id: &str) {}
    }

    fn test_session() -> Arc<StreamSession> {
        let config = SessionConfig {
            ws_uri: "ws://localhost:9000/test".into(),
            ..SessionConfig::default()
        };
        StreamSession::new("frame-test".into(), config).unwrap()
    }

    #[test]
    fn test_emit_delivers_at_most_one_frame() {
        let session = test_session();
        let recorder = FrameRecorder::default();
        let frame_bytes = session.config().media_frame_bytes();

        {
            let mut buffer = session.emit_buffer.lock().unwrap();
            buffer.write(&vec![7u8; frame_bytes]);
        }

        emit_media_frame(&session, &recorder);
        emit_media_frame(&session, &recorder);

        let frames = recorder.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), frame_bytes);
    }

    #[test]
    fn test_emit_holds_partial_frame_until_complete() {
        let session = test_session();
        let recorder = FrameRecorder::default();
        let frame_bytes = session.config().media_frame_bytes();

        {
            let mut buffer = session.emit_buffer.lock().unwrap();
            buffer.write(&[9u8; 100]);
        }

        // Less than a whole frame buffered: nothing may reach the engine
        emit_media_frame(&session, &recorder);
        assert!(recorder.frames.lock().unwrap().is_empty());
        assert_eq!(session.emit_buffer.lock().unwrap().in_use(), 100);

        {
            let mut buffer = session.emit_buffer.lock().unwrap();
            buffer.write(&vec![9u8; frame_bytes - 100]);
        }

        emit_media_frame(&session, &recorder);
        let frames = recorder.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), frame_bytes);
        assert!(session.emit_buffer.lock().unwrap().is_empty());
    }

    #[test]
    fn test_feed_frame_without_connection_is_dropped() {
        let bridge = Bridge::new(Arc::new(NullSink), Arc::new(FrameRecorder::default()));
        let session = test_session();
        // No connection attached; the frame has nowhere to go
        bridge.feed_frame(&session, &[0u8; 320]);
        assert!(session.ingest_buffer.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drain_helper_empties_buffer() {
        let mut buffer = RingBuffer::new(64).unwrap();
        buffer.write(&[1, 2, 3]);
        assert_eq!(buffer.drain(), vec![1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_without_session_is_noop() {
        let bridge = Bridge::new(Arc::new(NullSink), Arc::new(FrameRecorder::default()));
        assert!(!bridge.cleanup("never-registered", None).await);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let bridge = Bridge::new(Arc::new(NullSink), Arc::new(FrameRecorder::default()));
        let session = test_session();
        bridge.registry().register(Arc::clone(&session));

        assert!(bridge.cleanup(session.id(), None).await);
        assert!(!bridge.cleanup(session.id(), None).await);
        assert!(session.close_requested());
    }
}

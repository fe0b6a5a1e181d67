//! Inbound `streamAudio` control commands
//!
//! The remote endpoint can push audio back into the call. Raw PCM goes
//! through the emit-direction converter and into the emit buffer, where the
//! periodic write task picks it up one frame at a time. Encoded audio (wav,
//! mp3, ogg) is persisted to a temp file and announced to the host with a
//! `play` event; decoding compressed audio is the player's job, not ours.
//!
//! `process_message` returns whether the text was consumed here. Anything
//! that is not a well-formed `streamAudio` command belongs to the host.

use std::time::Duration;

use serde_json::Value;

use crate::connection::Connection;
use crate::events::EventKind;
use crate::protocol::{self, AudioDataType};
use crate::resampler::{bytes_to_samples, samples_to_bytes};
use crate::session::StreamSession;

/// How long one wait on a full emit buffer lasts.
const FULL_BUFFER_WAIT: Duration = Duration::from_millis(10);
/// Cap on full-buffer waits before the rest of a payload is dropped. The
/// write task drains one frame per 20ms, so this bounds a stall at ~2s.
const MAX_FULL_BUFFER_WAITS: u32 = 200;

/// Handle one inbound text message if it is a `streamAudio` command.
///
/// Returns `true` when the message was consumed (even if the payload was
/// unusable), `false` when it should pass through to the host as a `json`
/// event. On the file path, `text` is rewritten to the augmented data
/// object so downstream logging shows the file instead of the base64 blob.
pub async fn process_message(
    conn: &Connection,
    session: &StreamSession,
    text: &mut String,
) -> bool {
    let Some(mut command) = protocol::parse_stream_audio(text) else {
        return false;
    };

    let Some(data) = command.get_mut("data").filter(|d| d.is_object()) else {
        log::error!("({}) streamAudio command has no data object", session.id());
        return false;
    };

    let subtype = data
        .get("audioDataType")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let Some(audio_type) = AudioDataType::from_name(subtype) else {
        log::error!(
            "({}) unsupported audioDataType {:?}, ignoring command",
            session.id(),
            subtype
        );
        return true;
    };

    let Some(b64) = data.get("audioData").and_then(Value::as_str) else {
        log::error!("({}) streamAudio command has no audioData", session.id());
        return true;
    };
    let decoded = match protocol::decode_audio(b64) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("({}) audioData is not valid base64: {}", session.id(), e);
            return true;
        }
    };

    match audio_type {
        AudioDataType::Raw => {
            stream_raw_audio(session, data, decoded).await;
            true
        }
        AudioDataType::Wav | AudioDataType::Mp3 | AudioDataType::Ogg => {
            if let Some(payload) = persist_audio_file(conn, session, data, audio_type, &decoded) {
                *text = payload;
                conn.notify(EventKind::Play, text);
            }
            true
        }
    }
}

/// Queue raw PCM16 for the write task, converting to the media rate first.
///
/// When the emit buffer fills up, the payload waits in bounded 10ms steps
/// for the write task to drain a frame. Teardown aborts the wait.
async fn stream_raw_audio(session: &StreamSession, data: &Value, mut bytes: Vec<u8>) {
    if session.close_requested() {
        return;
    }

    // Advisory only; the session's transport rate drives conversion
    if let Some(declared) = data.get("sampleRate").and_then(Value::as_u64) {
        if declared as u32 != session.config().transport_sample_rate {
            log::warn!(
                "({}) declared sampleRate {} differs from session rate {}",
                session.id(),
                declared,
                session.config().transport_sample_rate
            );
        }
    }

    if let Some(converter) = &session.emit_resampler {
        match converter.lock() {
            Ok(mut converter) => {
                let samples = converter.convert(&bytes_to_samples(&bytes));
                bytes = samples_to_bytes(&samples);
            }
            Err(_) => {
                log::error!(
                    "({}) emit converter poisoned, dropping {} bytes",
                    session.id(),
                    bytes.len()
                );
                return;
            }
        }
    }

    let mut offset = 0;
    let mut waits = 0;
    while offset < bytes.len() {
        if session.close_requested() {
            log::debug!(
                "({}) close requested, dropping {} queued bytes",
                session.id(),
                bytes.len() - offset
            );
            return;
        }

        let written = match session.emit_buffer.lock() {
            Ok(mut buffer) => buffer.write(&bytes[offset..]),
            Err(_) => {
                log::error!(
                    "({}) emit buffer poisoned, dropping {} bytes",
                    session.id(),
                    bytes.len() - offset
                );
                return;
            }
        };
        offset += written;

        if written == 0 {
            waits += 1;
            if waits > MAX_FULL_BUFFER_WAITS {
                log::warn!(
                    "({}) emit buffer stalled, dropping {} bytes",
                    session.id(),
                    bytes.len() - offset
                );
                return;
            }
            tokio::time::sleep(FULL_BUFFER_WAIT).await;
        }
    }
}

/// Write an encoded payload to `{session}_{n}.tmp{ext}` under the session's
/// temp dir and return the augmented data object as the `play` payload.
fn persist_audio_file(
    conn: &Connection,
    session: &StreamSession,
    data: &mut Value,
    audio_type: AudioDataType,
    bytes: &[u8],
) -> Option<String> {
    let extension = audio_type.extension()?;
    let path = conn.temp_dir().join(format!(
        "{}_{}.tmp{}",
        session.id(),
        session.next_file_index(),
        extension
    ));

    if let Err(e) = std::fs::write(&path, bytes) {
        log::error!(
            "({}) failed to write {}: {}",
            session.id(),
            path.display(),
            e
        );
        return None;
    }
    log::debug!("({}) wrote {} bytes to {}", session.id(), bytes.len(), path.display());
    conn.record_temp_file(path.clone());

    // The host gets a file reference, not the payload itself
    if let Some(map) = data.as_object_mut() {
        map.remove("audioData");
        map.insert("file".into(), Value::String(path.to_string_lossy().into_owned()));
    }
    Some(data.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::events::{EventSink, MediaSink};
    use crate::session::SessionRegistry;
    use crate::transport::{Transport, TransportError};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    struct NullTransport;

    impl Transport for NullTransport {
        fn send_text(&self, _text: &str) -> Result<(), TransportError> {
            Ok(())
        }
        fn send_binary(&self, _data: Vec<u8>) -> Result<(), TransportError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            false
        }
        fn disconnect(&self) {}
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(EventKind, String)>>,
    }

    impl EventSink for RecordingSink {
        fn notify(&self, _session_id: &str, kind: EventKind, payload: &str) {
            self.events.lock().unwrap().push((kind, payload.to_string()));
        }
    }

    struct NullMedia;

    impl MediaSink for NullMedia {
        fn deliver_frame(&self, _session_id: &str, _frame: &[u8]) {}
        fn detach_requested(&self, _session_id: &str) {}
    }

    fn test_session(temp_dir: std::path::PathBuf) -> Arc<StreamSession> {
        let config = SessionConfig {
            ws_uri: "ws://localhost:9000/test".into(),
            temp_dir,
            ..SessionConfig::default()
        };
        StreamSession::new(uuid::Uuid::new_v4().to_string(), config).unwrap()
    }

    fn test_connection(
        session: &StreamSession,
        sink: Arc<RecordingSink>,
    ) -> Arc<Connection> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Connection::attach(
            session,
            Arc::new(NullTransport),
            rx,
            Arc::new(SessionRegistry::new()),
            sink,
            Arc::new(NullMedia),
        )
    }

    #[tokio::test]
    async fn test_non_control_text_passes_through() {
        let session = test_session(std::env::temp_dir());
        let conn = test_connection(&session, Arc::new(RecordingSink::default()));
        let mut text = r#"{"type":"transcript","text":"hello"}"#.to_string();
        assert!(!process_message(&conn, &session, &mut text).await);
    }

    #[tokio::test]
    async fn test_unsupported_subtype_is_consumed_silently() {
        let session = test_session(std::env::temp_dir());
        let sink = Arc::new(RecordingSink::default());
        let conn = test_connection(&session, Arc::clone(&sink));
        let mut text = json!({
            "type": "streamAudio",
            "data": { "audioDataType": "flac", "audioData": "AAAA" },
        })
        .to_string();
        assert!(process_message(&conn, &session, &mut text).await);
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_raw_audio_lands_in_emit_buffer() {
        let session = test_session(std::env::temp_dir());
        let conn = test_connection(&session, Arc::new(RecordingSink::default()));
        let pcm: Vec<u8> = (0u8..64).collect();
        let mut text = json!({
            "type": "streamAudio",
            "data": {
                "audioDataType": "raw",
                "audioData": protocol::encode_audio(&pcm),
            },
        })
        .to_string();

        assert!(process_message(&conn, &session, &mut text).await);
        let mut buffer = session.emit_buffer.lock().unwrap();
        assert_eq!(buffer.in_use(), pcm.len());
        assert_eq!(buffer.read(pcm.len()), pcm);
    }

    #[tokio::test]
    async fn test_raw_audio_dropped_after_close_request() {
        let session = test_session(std::env::temp_dir());
        let conn = test_connection(&session, Arc::new(RecordingSink::default()));
        session.request_close();
        let mut text = json!({
            "type": "streamAudio",
            "data": {
                "audioDataType": "raw",
                "audioData": protocol::encode_audio(&[1u8, 2, 3, 4]),
            },
        })
        .to_string();

        assert!(process_message(&conn, &session, &mut text).await);
        assert!(session.emit_buffer.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wav_payload_becomes_file_and_play_event() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path().to_path_buf());
        let sink = Arc::new(RecordingSink::default());
        let conn = test_connection(&session, Arc::clone(&sink));
        let body = b"RIFFfake-wav-bytes";
        let mut text = json!({
            "type": "streamAudio",
            "data": {
                "audioDataType": "wav",
                "audioData": protocol::encode_audio(body),
                "textPrompt": "greeting",
            },
        })
        .to_string();

        assert!(process_message(&conn, &session, &mut text).await);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (kind, payload) = &events[0];
        assert_eq!(*kind, EventKind::Play);

        let payload: Value = serde_json::from_str(payload).unwrap();
        assert!(payload.get("audioData").is_none());
        assert_eq!(payload["textPrompt"], "greeting");
        let file = payload["file"].as_str().unwrap();
        assert!(file.ends_with(".tmp.wav"));
        assert_eq!(std::fs::read(file).unwrap(), body);
        assert_eq!(conn.temp_file_paths().len(), 1);

        // Rewritten so the caller logs the file reference, not the blob
        assert_eq!(text, payload.to_string());
    }

    #[tokio::test]
    async fn test_file_names_use_session_counter() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path().to_path_buf());
        let sink = Arc::new(RecordingSink::default());
        let conn = test_connection(&session, Arc::clone(&sink));

        for _ in 0..2 {
            let mut text = json!({
                "type": "streamAudio",
                "data": {
                    "audioDataType": "mp3",
                    "audioData": protocol::encode_audio(b"mp3-bytes"),
                },
            })
            .to_string();
            assert!(process_message(&conn, &session, &mut text).await);
        }

        let events = sink.events.lock().unwrap();
        let first: Value = serde_json::from_str(&events[0].1).unwrap();
        let second: Value = serde_json::from_str(&events[1].1).unwrap();
        let id = session.id();
        assert!(first["file"]
            .as_str()
            .unwrap()
            .ends_with(&format!("{}_0.tmp.mp3", id)));
        assert!(second["file"]
            .as_str()
            .unwrap()
            .ends_with(&format!("{}_1.tmp.mp3", id)));
        assert_eq!(session.files_produced(), 2);
    }

    #[tokio::test]
    async fn test_delete_files_removes_persisted_audio() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path().to_path_buf());
        let conn = test_connection(&session, Arc::new(RecordingSink::default()));
        let mut text = json!({
            "type": "streamAudio",
            "data": {
                "audioDataType": "ogg",
                "audioData": protocol::encode_audio(b"OggS"),
            },
        })
        .to_string();
        assert!(process_message(&conn, &session, &mut text).await);

        let paths = conn.temp_file_paths();
        assert!(paths[0].exists());
        conn.delete_files();
        assert!(!paths[0].exists());
        // Second pass is a no-op
        conn.delete_files();
    }
}

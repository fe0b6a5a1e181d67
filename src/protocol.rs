//! Wire vocabulary shared with the remote endpoint
//!
//! Two kinds of JSON travel over the socket as text:
//!
//! - lifecycle payloads this crate emits toward the host (`connected`,
//!   `error`, `disconnected` status objects), and
//! - inbound control commands, of which only `streamAudio` is recognized.
//!   Everything else passes through to the host verbatim.
//!
//! Audio payloads inside control commands are base64; `raw` carries bare
//! PCM16, the file subtypes carry an opaque encoded blob that is persisted
//! for an external player rather than decoded here.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};

/// The only control command type this core interprets.
pub const STREAM_AUDIO_TYPE: &str = "streamAudio";

/// Payload subtype of a `streamAudio` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDataType {
    /// Bare PCM16 at the declared sample rate, fed into the emit buffer
    Raw,
    Wav,
    Mp3,
    Ogg,
}

impl AudioDataType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "raw" => Some(AudioDataType::Raw),
            "wav" => Some(AudioDataType::Wav),
            "mp3" => Some(AudioDataType::Mp3),
            "ogg" => Some(AudioDataType::Ogg),
            _ => None,
        }
    }

    /// File extension for subtypes persisted to storage; `None` for raw.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            AudioDataType::Raw => None,
            AudioDataType::Wav => Some(".wav"),
            AudioDataType::Mp3 => Some(".mp3"),
            AudioDataType::Ogg => Some(".ogg"),
        }
    }
}

/// `{"status":"connected"}` — body of the `connect` event.
pub fn connected_payload() -> String {
    json!({ "status": "connected" }).to_string()
}

/// Body of the `error` event surfaced on a transport fault.
pub fn error_payload(code: u16, error: &str) -> String {
    json!({
        "status": "error",
        "message": { "code": code, "error": error },
    })
    .to_string()
}

/// Body of the `disconnect` event surfaced when the socket closes.
pub fn disconnected_payload(code: u16, reason: &str) -> String {
    json!({
        "status": "disconnected",
        "message": { "code": code, "reason": reason },
    })
    .to_string()
}

/// Decode the base64 `audioData` field of a control command.
pub fn decode_audio(b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(b64)
}

/// Encode bytes the way `audioData` expects; used by tests and senders.
pub fn encode_audio(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Parse inbound text as a `streamAudio` command.
///
/// Returns the whole message as a JSON value only when it is well-formed
/// and carries the recognized type; anything else is the host's business.
pub fn parse_stream_audio(text: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("type").and_then(Value::as_str) == Some(STREAM_AUDIO_TYPE) {
        Some(value)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_data_type_names() {
        assert_eq!(AudioDataType::from_name("raw"), Some(AudioDataType::Raw));
        assert_eq!(AudioDataType::from_name("wav"), Some(AudioDataType::Wav));
        assert_eq!(AudioDataType::from_name("mp3"), Some(AudioDataType::Mp3));
        assert_eq!(AudioDataType::from_name("ogg"), Some(AudioDataType::Ogg));
        assert_eq!(AudioDataType::from_name("flac"), None);
    }

    #[test]
    fn test_extensions() {
        assert_eq!(AudioDataType::Raw.extension(), None);
        assert_eq!(AudioDataType::Wav.extension(), Some(".wav"));
        assert_eq!(AudioDataType::Ogg.extension(), Some(".ogg"));
    }

    #[test]
    fn test_connected_payload() {
        assert_eq!(connected_payload(), r#"{"status":"connected"}"#);
    }

    #[test]
    fn test_error_payload_shape() {
        let payload = error_payload(1006, "abnormal closure");
        let v: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["message"]["code"], 1006);
        assert_eq!(v["message"]["error"], "abnormal closure");
    }

    #[test]
    fn test_disconnected_payload_shape() {
        let payload = disconnected_payload(1000, "normal");
        let v: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["status"], "disconnected");
        assert_eq!(v["message"]["reason"], "normal");
    }

    #[test]
    fn test_parse_stream_audio_recognized() {
        let text = r#"{"type":"streamAudio","data":{"audioDataType":"raw"}}"#;
        let v = parse_stream_audio(text).unwrap();
        assert_eq!(v["data"]["audioDataType"], "raw");
    }

    #[test]
    fn test_parse_other_types_ignored() {
        assert!(parse_stream_audio(r#"{"type":"transcript","text":"hi"}"#).is_none());
        assert!(parse_stream_audio("not json at all").is_none());
        assert!(parse_stream_audio(r#"{"data":{}}"#).is_none());
    }

    #[test]
    fn test_audio_round_trip() {
        let bytes = vec![0x34u8, 0x12, 0x78, 0x56];
        let b64 = encode_audio(&bytes);
        assert_eq!(decode_audio(&b64).unwrap(), bytes);
        assert!(decode_audio("!!not base64!!").is_err());
    }
}

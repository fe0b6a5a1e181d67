//! Per-session configuration
//!
//! The host hands over a populated `SessionConfig`, or builds one from the
//! `STREAM_*` channel-variable set with `from_channel_vars`. Sample rates
//! and channel count are fixed for the lifetime of a session; changing them
//! means tearing the session down and creating a new one.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Fixed media frame interval of the telephony engine.
pub const FRAME_INTERVAL_MS: u32 = 20;

/// 20ms of PCM16 at 8kHz mono; scaled for other rates and channel counts.
const FRAME_SIZE_8000: usize = 320;

/// Sentinel for `tls.ca_file` disabling certificate validation entirely.
pub const TLS_CA_NONE: &str = "NONE";
/// Sentinel for `tls.ca_file` selecting the bundled trust store.
pub const TLS_CA_SYSTEM: &str = "SYSTEM";

/// TLS material for `wss://` endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// CA bundle path, or the `NONE` / `SYSTEM` sentinels
    pub ca_file: Option<String>,
    /// Client private key path (PEM)
    pub key_file: Option<String>,
    /// Client certificate path (PEM)
    pub cert_file: Option<String>,
    pub disable_hostname_validation: bool,
}

/// Everything one session needs, resolved before setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remote endpoint, `ws://` or `wss://`
    pub ws_uri: String,
    /// Rate of the media engine's frames (Hz)
    pub media_sample_rate: u32,
    /// Rate expected on the socket side (Hz)
    pub transport_sample_rate: u32,
    pub channels: usize,
    /// Sent as the very first outbound text after a successful connect
    pub metadata: Option<String>,
    /// How much audio to coalesce per transport message; must be a
    /// multiple of the 20ms frame interval
    pub buffer_len_ms: u32,
    /// Idle ping interval in seconds; disabled when absent
    pub heartbeat_secs: Option<u64>,
    /// Request per-message compression from the transport
    pub deflate: bool,
    /// Silence per-message response logging
    pub suppress_log: bool,
    pub tls: TlsOptions,
    /// JSON object of extra request headers, e.g. `{"Authorization":"..."}`
    pub extra_headers: Option<String>,
    /// Where control-command audio files are persisted
    pub temp_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ws_uri: String::new(),
            media_sample_rate: 8000,
            transport_sample_rate: 8000,
            channels: 1,
            metadata: None,
            buffer_len_ms: FRAME_INTERVAL_MS,
            heartbeat_secs: None,
            deflate: false,
            suppress_log: false,
            tls: TlsOptions::default(),
            extra_headers: None,
            temp_dir: std::env::temp_dir(),
        }
    }
}

impl SessionConfig {
    /// Build a config from the host's channel-variable set.
    ///
    /// Unset or malformed variables fall back to defaults; a heartbeat
    /// variable that does not parse leaves the heartbeat disabled.
    pub fn from_channel_vars(
        ws_uri: String,
        media_sample_rate: u32,
        transport_sample_rate: u32,
        channels: usize,
        metadata: Option<String>,
        vars: &HashMap<String, String>,
    ) -> Self {
        let truthy = |name: &str| {
            vars.get(name)
                .map(|v| matches!(v.as_str(), "true" | "1" | "yes" | "on"))
                .unwrap_or(false)
        };

        let mut config = Self {
            ws_uri,
            media_sample_rate,
            transport_sample_rate,
            channels,
            metadata,
            deflate: truthy("STREAM_MESSAGE_DEFLATE"),
            suppress_log: truthy("STREAM_SUPPRESS_LOG"),
            tls: TlsOptions {
                ca_file: vars.get("STREAM_TLS_CA_FILE").cloned(),
                key_file: vars.get("STREAM_TLS_KEY_FILE").cloned(),
                cert_file: vars.get("STREAM_TLS_CERT_FILE").cloned(),
                disable_hostname_validation: truthy("STREAM_TLS_DISABLE_HOSTNAME_VALIDATION"),
            },
            extra_headers: vars.get("STREAM_EXTRA_HEADERS").cloned(),
            ..Self::default()
        };

        if let Some(raw) = vars.get("STREAM_HEART_BEAT") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => config.heartbeat_secs = Some(secs),
                _ => log::warn!("ignoring unparseable STREAM_HEART_BEAT value {:?}", raw),
            }
        }

        if let Some(raw) = vars.get("STREAM_BUFFER_SIZE") {
            match raw.parse::<u32>() {
                Ok(ms) if ms >= FRAME_INTERVAL_MS && ms % FRAME_INTERVAL_MS == 0 => {
                    config.buffer_len_ms = ms;
                }
                _ => log::warn!(
                    "buffer size {:?} is not a multiple of {}ms, using default",
                    raw,
                    FRAME_INTERVAL_MS
                ),
            }
        }

        config
    }

    /// Number of 20ms intervals coalesced before an ingest-direction flush.
    pub fn batch_factor(&self) -> usize {
        (self.buffer_len_ms / FRAME_INTERVAL_MS).max(1) as usize
    }

    /// Samples per 20ms frame at `rate`, one channel.
    pub fn samples_per_frame(rate: u32) -> usize {
        (rate / 1000 * FRAME_INTERVAL_MS) as usize
    }

    /// Bytes of one 20ms media-native frame across all channels.
    pub fn media_frame_bytes(&self) -> usize {
        Self::samples_per_frame(self.media_sample_rate) * self.channels * 2
    }

    /// Bytes of one 20ms transport-rate frame across all channels.
    pub fn transport_frame_bytes(&self) -> usize {
        FRAME_SIZE_8000 * self.transport_sample_rate as usize / 8000 * self.channels
    }

    /// Ring buffer capacity: one full batch of transport-rate audio.
    pub fn buffer_capacity(&self) -> usize {
        self.transport_frame_bytes() * self.batch_factor()
    }

    /// Parse `extra_headers` into name/value pairs.
    ///
    /// Only string-valued members are honored, matching the wire contract;
    /// malformed JSON yields no headers.
    pub fn parse_extra_headers(&self) -> Vec<(String, String)> {
        let Some(raw) = &self.extra_headers else {
            return Vec::new();
        };
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .filter_map(|(k, v)| match v {
                    serde_json::Value::String(s) => Some((k, s)),
                    _ => None,
                })
                .collect(),
            _ => {
                log::warn!("extra headers are not a JSON object, ignoring");
                Vec::new()
            }
        }
    }
}

/// Accept only `ws://` or `wss://` URIs with a plausible `host[:port]`.
pub fn validate_ws_uri(uri: &str) -> bool {
    let rest = if let Some(r) = uri.strip_prefix("wss://") {
        r
    } else if let Some(r) = uri.strip_prefix("ws://") {
        r
    } else {
        return false;
    };

    let authority = rest.split('/').next().unwrap_or("");
    let (host, port) = match authority.split_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (authority, None),
    };

    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return false;
    }
    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    true
}

//! Duplex audio bridge between a fixed-cadence media engine and a remote
//! WebSocket endpoint
//!
//! The host hands this crate 20ms PCM16 frames from a live call; the crate
//! forwards them (rate-converted and optionally batched) as binary frames
//! on a WebSocket, and turns messages coming back into host events or
//! audio played into the call.
//!
//! # Architecture
//!
//! ```text
//! Media Frames (20ms) ──▶ feed_frame ──▶ convert ──▶ ingest ring ──▶ socket
//!                                                                      │
//!       MediaSink ◀── write task (20ms) ◀── emit ring ◀── streamAudio ◀┘
//!       EventSink ◀── connect / disconnect / error / json / play
//! ```
//!
//! # Threading
//!
//! Three actors touch a session: the host's media thread (`feed_frame`),
//! the periodic write task, and the transport dispatch task. The media
//! path only ever uses `try_lock`; contention costs a frame of audio,
//! never a stall. Teardown is a set-once flag every loop polls.

mod bridge;
mod buffer;
mod config;
mod connection;
mod control;
mod events;
mod protocol;
mod resampler;
mod session;
mod transport;

pub use bridge::Bridge;
pub use buffer::{BufferInitError, RingBuffer};
pub use config::{validate_ws_uri, SessionConfig, TlsOptions, FRAME_INTERVAL_MS};
pub use connection::{Connection, ConnectionState};
pub use events::{EventKind, EventSink, MediaSink};
pub use protocol::{
    connected_payload, decode_audio, disconnected_payload, encode_audio, error_payload,
    parse_stream_audio, AudioDataType, STREAM_AUDIO_TYPE,
};
pub use resampler::{bytes_to_samples, samples_to_bytes, Resampler, ResamplerInitError};
pub use session::{SessionRegistry, SetupError, StreamSession};
pub use transport::{
    ConnectOptions, Transport, TransportError, TransportEvent, WsTransport,
};

//! Host notification boundary
//!
//! The host sees this crate through two narrow traits: `EventSink` for the
//! closed set of named events, and `MediaSink` for emit-direction frames
//! headed back into the call. Both are invoked from threads the host does
//! not control (the transport dispatch task, the periodic write task), so
//! implementations must be cheap and must not block.

/// Closed set of events surfaced to the host, each with a JSON payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Socket opened; payload `{"status":"connected"}`
    Connect,
    /// Socket closed; payload carries close code and reason
    Disconnect,
    /// Transport fault; payload carries code and message
    Error,
    /// Inbound text that was not a recognized control command, verbatim
    Json,
    /// A file-producing control command was handled; payload names the file
    Play,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Error => "error",
            EventKind::Json => "json",
            EventKind::Play => "play",
        }
    }
}

/// Single host-notification callback: (session, kind, payload).
pub trait EventSink: Send + Sync {
    fn notify(&self, session_id: &str, kind: EventKind, payload: &str);
}

/// Emit-direction boundary toward the media engine.
pub trait MediaSink: Send + Sync {
    /// Deliver exactly one media frame of PCM16 back into the call.
    fn deliver_frame(&self, session_id: &str, frame: &[u8]);

    /// Ask the host to detach the session's media hook; sent after a
    /// transport error. Teardown remains the host's responsibility.
    fn detach_requested(&self, session_id: &str);
}

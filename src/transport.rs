//! WebSocket transport client
//!
//! The rest of the crate talks to the socket through the narrow `Transport`
//! trait (send text/binary, connection check, disconnect) plus a stream of
//! `TransportEvent`s standing in for the four lifecycle callbacks. This
//! module provides the tokio-tungstenite implementation.
//!
//! # Structure
//!
//! `WsTransport::connect` returns immediately; a background task performs
//! the handshake and then drives both halves of the socket. Outbound sends
//! go through an unbounded queue so the media-frame thread is never blocked
//! on the network. Events are delivered in the order the connection
//! generates them.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        protocol::Message,
        Error as WsError,
    },
    Connector,
};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

use crate::config::{TlsOptions, TLS_CA_NONE, TLS_CA_SYSTEM};

/// Lifecycle and message notifications from a connection, delivered in
/// generation order on the transport's own task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Socket opened and ready for traffic
    Open,
    /// Inbound text frame
    Message(String),
    /// Handshake or socket fault; `code` is an HTTP status when one exists
    Error { code: u16, message: String },
    /// Socket closed, cleanly or not
    Closed { code: u16, reason: String },
}

/// Errors surfaced to direct callers of the transport.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Send attempted before the socket opened or after it closed
    NotConnected,
    /// The connection task has already exited
    QueueClosed,
    /// TLS material could not be loaded or applied
    Tls(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "socket is not connected"),
            TransportError::QueueClosed => write!(f, "connection task has exited"),
            TransportError::Tls(e) => write!(f, "TLS configuration error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

/// Minimal surface the bridge needs from any socket implementation.
pub trait Transport: Send + Sync {
    fn send_text(&self, text: &str) -> Result<(), TransportError>;
    fn send_binary(&self, data: Vec<u8>) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    /// Idempotent; actual close happens on the connection task.
    fn disconnect(&self);
}

enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// tokio-tungstenite backed `Transport`.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    connected: AtomicBool,
    closing: AtomicBool,
}

/// Everything the connect task needs besides the URI.
pub struct ConnectOptions {
    pub headers: Vec<(String, String)>,
    pub tls: TlsOptions,
    /// Idle ping interval; `None` disables the keepalive ticker
    pub ping_interval: Option<Duration>,
    pub deflate: bool,
}

impl WsTransport {
    /// Start connecting to `uri` in the background.
    ///
    /// The handle is usable immediately; sends fail with `NotConnected`
    /// until the `Open` event arrives on `events`.
    pub fn connect(
        uri: String,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            outbound: tx,
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        tokio::spawn(run_connection(
            uri,
            options,
            events,
            rx,
            Arc::clone(&transport),
        ));
        transport
    }
}

impl Transport for WsTransport {
    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| TransportError::QueueClosed)
    }

    fn send_binary(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(Outbound::Binary(data))
            .map_err(|_| TransportError::QueueClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn disconnect(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            // Ignore failure: the task already exited and the socket with it
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

async fn run_connection(
    uri: String,
    options: ConnectOptions,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    transport: Arc<WsTransport>,
) {
    let mut request = match uri.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            let _ = events.send(TransportEvent::Error {
                code: 0,
                message: e.to_string(),
            });
            return;
        }
    };

    for (name, value) in &options.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                request.headers_mut().insert(name, value);
            }
            _ => log::warn!("skipping invalid extra header {:?}", name),
        }
    }

    if options.deflate {
        // tungstenite does not negotiate permessage-deflate; keep the knob
        // but do not pretend it took effect.
        log::debug!("per-message deflate requested but unsupported by transport, ignoring");
    }

    let connector = match build_connector(&options.tls) {
        Ok(c) => c,
        Err(e) => {
            let _ = events.send(TransportEvent::Error {
                code: 0,
                message: e.to_string(),
            });
            return;
        }
    };

    log::debug!("connecting to {}", uri);
    let ws = match connect_async_tls_with_config(request, None, true, connector).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let _ = events.send(TransportEvent::Error {
                code: error_code(&e),
                message: e.to_string(),
            });
            return;
        }
    };

    transport.connected.store(true, Ordering::Release);
    let _ = events.send(TransportEvent::Open);

    let (mut write, mut read) = ws.split();

    let ping_enabled = options.ping_interval.is_some();
    let mut ping = tokio::time::interval(
        options
            .ping_interval
            .unwrap_or_else(|| Duration::from_secs(3600)),
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // first tick fires immediately, swallow it

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    let _ = write.send(Message::Close(None)).await;
                    let _ = events.send(TransportEvent::Closed { code, reason });
                    break;
                }
                Some(Ok(_)) => {} // binary/ping/pong: nothing to dispatch
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error {
                        code: error_code(&e),
                        message: e.to_string(),
                    });
                    break;
                }
                None => {
                    let _ = events.send(TransportEvent::Closed {
                        code: 1006,
                        reason: "stream ended".to_string(),
                    });
                    break;
                }
            },
            queued = outbound.recv() => match queued {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        let _ = events.send(TransportEvent::Error {
                            code: error_code(&e),
                            message: e.to_string(),
                        });
                        break;
                    }
                }
                Some(Outbound::Binary(data)) => {
                    if let Err(e) = write.send(Message::Binary(data.into())).await {
                        let _ = events.send(TransportEvent::Error {
                            code: error_code(&e),
                            message: e.to_string(),
                        });
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = events.send(TransportEvent::Closed {
                        code: 1000,
                        reason: "client disconnect".to_string(),
                    });
                    break;
                }
            },
            _ = ping.tick(), if ping_enabled => {
                if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                    let _ = events.send(TransportEvent::Error {
                        code: error_code(&e),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    }

    transport.connected.store(false, Ordering::Release);
    log::debug!("connection task for {} exiting", uri);
}

fn error_code(e: &WsError) -> u16 {
    match e {
        WsError::Http(response) => response.status().as_u16(),
        _ => 0,
    }
}

/// Translate `TlsOptions` into a rustls connector.
///
/// `ca_file` supports the `NONE` sentinel (no certificate validation at
/// all) and `SYSTEM` (bundled web roots, same as leaving it unset while
/// other TLS material is present). Returns `None` when no option is set so
/// the library default applies.
fn build_connector(tls: &TlsOptions) -> Result<Option<Connector>, TransportError> {
    let custom = tls.ca_file.is_some()
        || tls.cert_file.is_some()
        || tls.key_file.is_some()
        || tls.disable_hostname_validation;
    if !custom {
        return Ok(None);
    }

    let no_verify =
        tls.ca_file.as_deref() == Some(TLS_CA_NONE) || tls.disable_hostname_validation;
    if tls.disable_hostname_validation && tls.ca_file.as_deref() != Some(TLS_CA_NONE) {
        log::warn!("hostname validation disabled: certificate validation is skipped entirely");
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let builder = if no_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        match tls.ca_file.as_deref() {
            Some(TLS_CA_SYSTEM) | None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
            Some(path) => {
                let certs = CertificateDer::pem_file_iter(path)
                    .map_err(|e| TransportError::Tls(format!("CA file {}: {}", path, e)))?;
                for cert in certs {
                    let cert =
                        cert.map_err(|e| TransportError::Tls(format!("CA file {}: {}", path, e)))?;
                    roots
                        .add(cert)
                        .map_err(|e| TransportError::Tls(e.to_string()))?;
                }
            }
        }
        builder.with_root_certificates(roots)
    };

    let config = match (&tls.cert_file, &tls.key_file) {
        (Some(cert_path), Some(key_path)) => {
            let certs: Vec<CertificateDer> = CertificateDer::pem_file_iter(cert_path)
                .map_err(|e| TransportError::Tls(format!("cert file {}: {}", cert_path, e)))?
                .collect::<Result<_, _>>()
                .map_err(|e| TransportError::Tls(format!("cert file {}: {}", cert_path, e)))?;
            let key = PrivateKeyDer::from_pem_file(key_path)
                .map_err(|e| TransportError::Tls(format!("key file {}: {}", key_path, e)))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TransportError::Tls(e.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Some(Connector::Rustls(Arc::new(config))))
}

/// Accepts any server certificate; selected by the `NONE` CA sentinel.
#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_tls_options_uses_library_default() {
        let connector = build_connector(&TlsOptions::default()).unwrap();
        assert!(connector.is_none());
    }

    #[test]
    fn test_none_sentinel_builds_connector() {
        let tls = TlsOptions {
            ca_file: Some(TLS_CA_NONE.to_string()),
            ..TlsOptions::default()
        };
        assert!(build_connector(&tls).unwrap().is_some());
    }

    #[test]
    fn test_system_sentinel_builds_connector() {
        let tls = TlsOptions {
            ca_file: Some(TLS_CA_SYSTEM.to_string()),
            ..TlsOptions::default()
        };
        assert!(build_connector(&tls).unwrap().is_some());
    }

    #[test]
    fn test_missing_ca_file_is_an_error() {
        let tls = TlsOptions {
            ca_file: Some("/nonexistent/ca.pem".to_string()),
            ..TlsOptions::default()
        };
        assert!(matches!(
            build_connector(&tls),
            Err(TransportError::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_sends_fail_before_open() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = WsTransport::connect(
            "ws://127.0.0.1:1".to_string(),
            ConnectOptions {
                headers: Vec::new(),
                tls: TlsOptions::default(),
                ping_interval: None,
                deflate: false,
            },
            events_tx,
        );
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send_text("hello"),
            Err(TransportError::NotConnected)
        ));
        transport.disconnect();
        transport.disconnect(); // idempotent
    }
}

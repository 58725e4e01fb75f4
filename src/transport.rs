//! The outbound seam: one HTTP exchange, no retry or rate-limit logic.
//!
//! The engine builds an [`OutboundRequest`] per attempt and hands it to a [`Transport`].
//! Implementations report failures as [`TransportError`]s whose [`TransportErrorKind`] tells the
//! engine whether the attempt may be retried. Dropping the returned future cancels the call.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::fmt;

use crate::error::BoxError;

/// A fully prepared request for a single attempt.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Proxy URL to route this call through, if any.
    pub proxy: Option<String>,
}

/// A buffered response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Failure classes the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The peer reset the connection.
    ConnectionReset,
    /// The operation timed out.
    TimedOut,
    /// The TLS handshake failed.
    TlsHandshake,
    /// Writing the request (or reading its body) failed mid-stream.
    WriteFailed,
    /// Anything else; never retried.
    Other,
}

impl TransportErrorKind {
    /// Whether an attempt failing this way may be retried.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, TransportErrorKind::Other)
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::ConnectionReset => "connection reset",
            TransportErrorKind::TimedOut => "timed out",
            TransportErrorKind::TlsHandshake => "tls handshake failed",
            TransportErrorKind::WriteFailed => "write failed",
            TransportErrorKind::Other => "transport error",
        };
        f.write_str(name)
    }
}

/// Error returned by a [`Transport`].
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    pub fn with_source(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self { kind, message: source.to_string(), source: Some(source) }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

/// Executes single HTTP exchanges.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;
}

#[cfg(feature = "reqwest")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use super::*;
    use std::collections::HashMap;
    use std::error::Error as _;
    use std::sync::Mutex;
    use std::time::Duration;

    /// [`Transport`] backed by `reqwest`, with one pooled client per proxy.
    #[derive(Debug)]
    pub struct ReqwestTransport {
        timeout: Duration,
        clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
    }

    impl Default for ReqwestTransport {
        fn default() -> Self {
            Self::new(Duration::from_secs(30))
        }
    }

    impl ReqwestTransport {
        pub fn new(timeout: Duration) -> Self {
            Self { timeout, clients: Mutex::new(HashMap::new()) }
        }

        fn client(&self, proxy: Option<&str>) -> Result<reqwest::Client, TransportError> {
            let key = proxy.map(str::to_owned);
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(client) = clients.get(&key) {
                return Ok(client.clone());
            }
            let mut builder = reqwest::Client::builder().timeout(self.timeout);
            if let Some(url) = proxy {
                let proxy = reqwest::Proxy::all(url)
                    .map_err(|e| TransportError::with_source(TransportErrorKind::Other, e))?;
                builder = builder.proxy(proxy);
            }
            let client = builder
                .build()
                .map_err(|e| TransportError::with_source(TransportErrorKind::Other, e))?;
            clients.insert(key, client.clone());
            Ok(client)
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn send(
            &self,
            request: OutboundRequest,
        ) -> Result<TransportResponse, TransportError> {
            let client = self.client(request.proxy.as_deref())?;
            let mut builder = client
                .request(request.method, &request.url)
                .query(&request.query)
                .headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(classify)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(classify)?;
            Ok(TransportResponse { status, headers, body })
        }
    }

    /// Map a reqwest failure onto the engine's recoverability classes.
    fn classify(err: reqwest::Error) -> TransportError {
        let kind = if err.is_timeout() {
            TransportErrorKind::TimedOut
        } else {
            io_kind(&err).unwrap_or_else(|| {
                if err.is_body() {
                    TransportErrorKind::WriteFailed
                } else if err.is_connect() && mentions_tls(&err) {
                    TransportErrorKind::TlsHandshake
                } else {
                    TransportErrorKind::Other
                }
            })
        };
        TransportError::with_source(kind, err)
    }

    fn io_kind(err: &reqwest::Error) -> Option<TransportErrorKind> {
        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return match io.kind() {
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                        Some(TransportErrorKind::ConnectionReset)
                    }
                    std::io::ErrorKind::TimedOut => Some(TransportErrorKind::TimedOut),
                    std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::WriteZero => {
                        Some(TransportErrorKind::WriteFailed)
                    }
                    _ => None,
                };
            }
            source = cause.source();
        }
        None
    }

    fn mentions_tls(err: &reqwest::Error) -> bool {
        let mut source = err.source();
        while let Some(cause) = source {
            let text = cause.to_string().to_ascii_lowercase();
            if text.contains("tls") || text.contains("handshake") || text.contains("certificate") {
                return true;
            }
            source = cause.source();
        }
        false
    }
}

//! Per-request context.
//!
//! Two context types exist at different layers:
//!
//! - [`ConnectContext`] is the negotiated wire configuration (protocol,
//!   compression, limits, timeout) stored in request extensions by
//!   [`ConnectLayer`](crate::layer::ConnectLayer).
//! - [`RequestContext`] is the handler-facing view: incoming headers, the
//!   method being served, writable response metadata, and the deadline.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use connect_rs_core::{
    CompressionConfig, CompressionEncoding, MethodSpec, RpcContentType, decode_binary_value,
};
use http::HeaderMap;
use tokio::time::Instant;

use crate::limits::MessageLimits;

/// Server-wide configuration applied by the layer.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub limits: MessageLimits,
    /// Require the `Connect-Protocol-Version` header on every request.
    pub require_protocol_header: bool,
    /// Content type assumed for unary POST requests without a Content-Type
    /// header. `None` rejects such requests with `unimplemented`.
    pub default_unary_content_type: Option<RpcContentType>,
    pub compression: CompressionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            limits: MessageLimits::default(),
            require_protocol_header: false,
            default_unary_content_type: Some(RpcContentType::UnaryProto),
            compression: CompressionConfig::default(),
        }
    }
}

/// Negotiated wire configuration for one request.
#[derive(Debug, Clone)]
pub struct ConnectContext {
    pub protocol: RpcContentType,
    pub limits: MessageLimits,
    /// Encoding of the incoming body (or incoming envelopes for streams).
    pub request_encoding: CompressionEncoding,
    /// Encoding chosen for the outgoing body from the peer's accept set.
    pub response_encoding: CompressionEncoding,
    pub compression: CompressionConfig,
    pub timeout: Option<Duration>,
}

impl Default for ConnectContext {
    fn default() -> Self {
        Self {
            protocol: RpcContentType::default(),
            limits: MessageLimits::default(),
            request_encoding: CompressionEncoding::Identity,
            response_encoding: CompressionEncoding::Identity,
            compression: CompressionConfig::default(),
            timeout: None,
        }
    }
}

/// The context passed to every handler.
///
/// Cloning is cheap; response metadata is shared so the engine can read it at
/// flush time. One context exists per request and is dropped when the HTTP
/// exchange completes.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: MethodSpec,
    headers: Arc<HeaderMap>,
    response_headers: Arc<Mutex<HeaderMap>>,
    response_trailers: Arc<Mutex<HeaderMap>>,
    deadline: Option<Instant>,
    peer: Option<SocketAddr>,
    canceled: Arc<AtomicBool>,
}

impl RequestContext {
    pub(crate) fn new(
        method: MethodSpec,
        headers: HeaderMap,
        timeout: Option<Duration>,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            method,
            headers: Arc::new(headers),
            response_headers: Arc::new(Mutex::new(HeaderMap::new())),
            response_trailers: Arc::new(Mutex::new(HeaderMap::new())),
            deadline: timeout.map(|t| Instant::now() + t),
            peer,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The method being served.
    pub fn method(&self) -> &MethodSpec {
        &self.method
    }

    /// Incoming request headers (read-only).
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Decode a `-Bin` metadata header into raw bytes. Returns `None` when
    /// the header is absent or not valid base64.
    pub fn binary_header(&self, name: &str) -> Option<Vec<u8>> {
        let value = self.headers.get(name)?;
        match decode_binary_value(value) {
            Ok(bytes) => Some(bytes),
            Err(_) => {
                tracing::debug!(name, "binary metadata is not valid base64, ignored");
                None
            }
        }
    }

    /// Headers to send with the response. Writes after the response has been
    /// committed are ignored.
    pub fn response_headers(&self) -> MutexGuard<'_, HeaderMap> {
        self.response_headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Trailers to send after the response body: `Trailer-`-prefixed headers
    /// for unary responses, the end-of-stream `metadata` map for streams.
    /// Writes after the end-of-stream envelope has been sent are ignored.
    pub fn response_trailers(&self) -> MutexGuard<'_, HeaderMap> {
        self.response_trailers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn take_response_headers(&self) -> HeaderMap {
        std::mem::take(&mut *self.response_headers())
    }

    pub(crate) fn take_response_trailers(&self) -> HeaderMap {
        std::mem::take(&mut *self.response_trailers())
    }

    /// The absolute deadline derived from `Connect-Timeout-Ms`, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline. `None` means no deadline.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Address of the peer, when the HTTP adapter supplied one.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the request has been canceled: the deadline elapsed, the peer
    /// went away, or the server shut the exchange down. Cancellation is
    /// cooperative; handlers should poll this at natural checkpoints.
    pub fn is_canceled(&self) -> bool {
        if self.canceled.load(Ordering::Relaxed) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }
}

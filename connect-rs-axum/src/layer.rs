//! Protocol negotiation middleware.
//!
//! [`ConnectLayer`] runs before routing-independent work can happen in the
//! handlers: it detects the protocol variant, validates the protocol version
//! header, parses the timeout, negotiates compression in both directions,
//! fail-fasts oversized declared bodies, and stores the resulting
//! [`ConnectContext`] in request extensions. It also enforces the request
//! timeout around the inner service.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Method, Request, header};
use axum::response::Response;
use connect_rs_core::{
    Code, CompressionEncoding, ConnectError, RpcContentType, STREAM_ACCEPT_ENCODING_HEADER,
    STREAM_ENCODING_HEADER, negotiate_response_encoding, parse_timeout, supported_encodings,
    validate_protocol_version,
};
use tower::{Layer, Service, ServiceExt};

use crate::context::{ConnectContext, ServerConfig};
use crate::response::error_response;

/// Layer that wraps a router with Connect protocol negotiation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectLayer {
    config: ServerConfig,
}

impl ConnectLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn limits(mut self, limits: crate::limits::MessageLimits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn require_protocol_header(mut self, require: bool) -> Self {
        self.config.require_protocol_header = require;
        self
    }

    pub fn compression(mut self, compression: connect_rs_core::CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    /// Content type assumed for unary POSTs without a Content-Type header;
    /// `None` rejects them instead.
    pub fn default_unary_content_type(mut self, default: Option<RpcContentType>) -> Self {
        self.config.default_unary_content_type = default;
        self
    }
}

impl<S> Layer<S> for ConnectLayer {
    type Service = ConnectService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConnectService {
            inner,
            config: self.config,
        }
    }
}

/// Service wrapper produced by [`ConnectLayer`].
#[derive(Debug, Clone)]
pub struct ConnectService<S> {
    inner: S,
    config: ServerConfig,
}

impl<S> Service<Request<Body>> for ConnectService<S>
where
    S: Service<Request<Body>, Response = Response, Error = std::convert::Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let config = self.config;
        let inner = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, inner);

        Box::pin(async move {
            let ctx = match negotiate(&req, &config) {
                Ok(ctx) => ctx,
                Err((protocol, err)) => return Ok(error_response(protocol, err)),
            };

            let timeout = ctx.timeout;
            let protocol = ctx.protocol;
            req.extensions_mut().insert(ctx);

            match timeout {
                Some(duration) => match tokio::time::timeout(duration, inner.oneshot(req)).await {
                    Ok(result) => result,
                    Err(_) => Ok(error_response(
                        protocol,
                        ConnectError::new(Code::DeadlineExceeded, "request timed out"),
                    )),
                },
                None => inner.oneshot(req).await,
            }
        })
    }
}

/// Run all pre-routing negotiation. On failure, returns the protocol to
/// render the error with alongside the error itself.
fn negotiate(
    req: &Request<Body>,
    config: &ServerConfig,
) -> Result<ConnectContext, (RpcContentType, ConnectError)> {
    let protocol = detect_protocol(req, config);
    if !protocol.is_valid() {
        // A GET with a bad `encoding` parameter is a malformed query, not an
        // unsupported content type.
        if *req.method() == Method::GET {
            return Err((
                RpcContentType::UnaryJson,
                ConnectError::invalid_argument(
                    "encoding query parameter must be \"proto\" or \"json\"",
                ),
            ));
        }
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("<missing>");
        return Err((
            RpcContentType::Unknown,
            ConnectError::new(
                Code::Unimplemented,
                format!("unsupported content-type \"{content_type}\""),
            ),
        ));
    }

    validate_protocol_version(req.headers(), config.require_protocol_header)
        .map_err(|e| (protocol, e))?;

    let timeout = parse_timeout(req.headers()).map_err(|e| (protocol, e))?;

    // Streams negotiate per-frame compression through the connect-* headers;
    // unary bodies use the plain HTTP pair.
    let (encoding_header, accept_header) = if protocol.is_streaming() {
        (STREAM_ENCODING_HEADER, STREAM_ACCEPT_ENCODING_HEADER)
    } else {
        ("content-encoding", "accept-encoding")
    };

    let request_encoding_value = req
        .headers()
        .get(encoding_header)
        .and_then(|v| v.to_str().ok());
    let request_encoding = CompressionEncoding::from_header(request_encoding_value)
        .ok_or_else(|| {
            tracing::debug!(
                encoding = request_encoding_value.unwrap_or(""),
                "request compression not supported"
            );
            (
                protocol,
                ConnectError::new(
                    Code::Unimplemented,
                    format!(
                        "unknown compression \"{}\": supported encodings are {}",
                        request_encoding_value.unwrap_or(""),
                        supported_encodings()
                    ),
                ),
            )
        })?;

    let response_encoding = negotiate_response_encoding(
        req.headers()
            .get(accept_header)
            .and_then(|v| v.to_str().ok()),
    );

    if let Some(declared) = content_length(req) {
        config
            .limits
            .check_size(declared)
            .map_err(|msg| (protocol, ConnectError::new(Code::ResourceExhausted, msg)))?;
    }

    Ok(ConnectContext {
        protocol,
        limits: config.limits,
        request_encoding,
        response_encoding,
        compression: config.compression,
        timeout,
    })
}

/// Identify the protocol variant for this request.
///
/// GET requests carry the codec in the `encoding` query parameter; POST
/// requests in the Content-Type header, with the configured default applied
/// when the header is missing.
fn detect_protocol(req: &Request<Body>, config: &ServerConfig) -> RpcContentType {
    if *req.method() == Method::GET {
        if let Some(query) = req.uri().query() {
            for pair in query.split('&') {
                if let Some(value) = pair.strip_prefix("encoding=") {
                    return RpcContentType::from_get_encoding(value);
                }
            }
        }
        // Missing `encoding` is rejected during extraction; JSON keeps the
        // error readable.
        return RpcContentType::UnaryJson;
    }

    match req.headers().get(header::CONTENT_TYPE) {
        Some(value) => {
            RpcContentType::from_content_type(value.to_str().unwrap_or(""))
        }
        None => config
            .default_unary_content_type
            .unwrap_or(RpcContentType::Unknown),
    }
}

fn content_length(req: &Request<Body>) -> Option<usize> {
    req.headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

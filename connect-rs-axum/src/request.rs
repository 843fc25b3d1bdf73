//! Request decoding: unary POST bodies, unary GET query strings, and framed
//! streams.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::Request;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use bytes::Bytes;
use connect_rs_core::{
    Code, CompressionEncoding, ConnectError, EnvelopeDecoder, decode_message, decompress,
    open_frame, supported_encodings,
};
use futures::Stream;
use http_body_util::BodyExt;
use prost::Message;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::context::{ConnectContext, RequestContext};

// URL-safe base64 that tolerates both padded and unpadded input. The
// protocol emits unpadded base64url; peers send everything.
const URL_SAFE_INDIFFERENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const STANDARD_INDIFFERENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

static WARNED_MISSING_LAYER: AtomicBool = AtomicBool::new(false);

/// Get the negotiated context from request extensions, or a default when the
/// layer is missing (warned once per process).
pub fn get_context_or_default(req: &Request<Body>) -> ConnectContext {
    if let Some(ctx) = req.extensions().get::<ConnectContext>() {
        return ctx.clone();
    }

    if !WARNED_MISSING_LAYER.swap(true, Ordering::Relaxed) {
        tracing::warn!(
            target: "connect_rs_axum",
            "ConnectLayer not found in request extensions; using defaults. \
             Build the router through MakeServiceBuilder or add ConnectLayer manually."
        );
    }

    ConnectContext::default()
}

/// Read the whole body with a size cap. Exceeding the cap is
/// `resource_exhausted`.
pub async fn read_body(body: Body, max_size: usize) -> Result<Bytes, ConnectError> {
    axum::body::to_bytes(body, max_size).await.map_err(|e| {
        ConnectError::new(
            Code::ResourceExhausted,
            format!("failed to read request body: {e}"),
        )
    })
}

/// Decode a unary POST request body: read, decompress, check the limit,
/// decode with the negotiated codec.
pub async fn extract_unary_post<T>(ctx: &ConnectContext, req: Request<Body>) -> Result<T, ConnectError>
where
    T: Message + DeserializeOwned + Default,
{
    let body = read_body(req.into_body(), ctx.limits.max_receive_bytes_or_max()).await?;
    let body = decompress(body, ctx.request_encoding)?;
    ctx.limits
        .check_size(body.len())
        .map_err(|msg| ConnectError::new(Code::ResourceExhausted, msg))?;
    decode_message(ctx.protocol, &body)
}

/// Query parameters of a unary GET request.
#[derive(Debug, Default, Deserialize)]
struct GetQuery {
    #[serde(default)]
    connect: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    base64: Option<String>,
    #[serde(default)]
    compression: Option<String>,
}

/// Decode a unary GET request from its query string.
///
/// `connect=v1`, `encoding`, and `message` are required. The message is
/// base64url without padding by default; `base64=1` switches to standard
/// base64 with padding. Both padding modes are accepted either way.
pub fn extract_unary_get<T>(ctx: &ConnectContext, req: &Request<Body>) -> Result<T, ConnectError>
where
    T: Message + DeserializeOwned + Default,
{
    let query = req.uri().query().unwrap_or("");
    let params: GetQuery = serde_qs::from_str(query)
        .map_err(|e| ConnectError::new(Code::InvalidArgument, e.to_string()))?;

    match params.connect.as_deref() {
        Some("v1") => {}
        Some(other) => {
            return Err(ConnectError::invalid_argument(format!(
                "connect query parameter must be \"v1\": got \"{other}\""
            )));
        }
        None => {
            return Err(ConnectError::invalid_argument(
                "missing required query parameter: connect",
            ));
        }
    }
    if params.encoding.is_none() {
        return Err(ConnectError::invalid_argument(
            "missing required query parameter: encoding",
        ));
    }
    let Some(message) = params.message else {
        return Err(ConnectError::invalid_argument(
            "missing required query parameter: message",
        ));
    };

    let bytes = if params.base64.as_deref() == Some("1") {
        STANDARD_INDIFFERENT.decode(&message)
    } else {
        URL_SAFE_INDIFFERENT.decode(&message)
    }
    .map_err(|e| ConnectError::invalid_argument(format!("invalid message encoding: {e}")))?;

    let bytes = match params.compression.as_deref() {
        Some("identity") | Some("") | None => Bytes::from(bytes),
        Some(name) => match CompressionEncoding::from_header(Some(name)) {
            Some(encoding) => decompress(Bytes::from(bytes), encoding)?,
            None => {
                return Err(ConnectError::new(
                    Code::Unimplemented,
                    format!(
                        "unknown compression \"{name}\": supported encodings are {}",
                        supported_encodings()
                    ),
                ));
            }
        },
    };

    ctx.limits
        .check_size(bytes.len())
        .map_err(|msg| ConnectError::new(Code::ResourceExhausted, msg))?;
    decode_message(ctx.protocol, &bytes)
}

/// Decode the single request message of a server-streaming call: one data
/// envelope, optionally followed by an end-of-stream envelope.
pub async fn extract_stream_single<T>(
    ctx: &ConnectContext,
    req: Request<Body>,
) -> Result<T, ConnectError>
where
    T: Message + DeserializeOwned + Default,
{
    let body = read_body(req.into_body(), ctx.limits.max_receive_bytes_or_max()).await?;

    let mut decoder = EnvelopeDecoder::new(ctx.limits.max_receive_bytes());
    decoder.push(&body);

    let Some(first) = decoder.next_frame()? else {
        return Err(decoder
            .finish()
            .err()
            .unwrap_or_else(|| ConnectError::invalid_argument("missing request message")));
    };
    let Some(payload) = open_frame(first, ctx.request_encoding)? else {
        return Err(ConnectError::invalid_argument("missing request message"));
    };
    ctx.limits
        .check_size(payload.len())
        .map_err(|msg| ConnectError::new(Code::ResourceExhausted, msg))?;
    let message = decode_message(ctx.protocol, &payload)?;

    // Only an end-of-stream envelope may follow.
    while let Some(frame) = decoder.next_frame()? {
        if !frame.is_end_stream() {
            return Err(ConnectError::invalid_argument(
                "expected a single request message",
            ));
        }
    }
    decoder.finish()?;

    Ok(message)
}

/// A lazy stream of decoded request messages, for client-streaming and bidi
/// handlers.
pub struct Streaming<T> {
    inner: Pin<Box<dyn Stream<Item = Result<T, ConnectError>> + Send>>,
}

impl<T> Streaming<T> {
    pub fn new(stream: Pin<Box<dyn Stream<Item = Result<T, ConnectError>> + Send>>) -> Self {
        Self { inner: stream }
    }

    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = Result<T, ConnectError>> + Send>> {
        self.inner
    }
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T, ConnectError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> std::fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streaming").finish_non_exhaustive()
    }
}

/// Turn a request body into a `Streaming<T>` of decoded messages.
///
/// Messages are delivered strictly in arrival order; each envelope payload is
/// size-checked after decompression. An end-of-stream envelope or body end
/// terminates the stream. A body read failure or a body that stops mid-frame
/// means the peer went away: the request context is canceled before the
/// error is surfaced.
pub fn extract_streaming<T>(
    ctx: &ConnectContext,
    rctx: &RequestContext,
    req: Request<Body>,
) -> Streaming<T>
where
    T: Message + DeserializeOwned + Default + Send + 'static,
{
    let protocol = ctx.protocol;
    let request_encoding = ctx.request_encoding;
    let limits = ctx.limits;
    let rctx = rctx.clone();
    let body = req.into_body();

    let stream = async_stream::stream! {
        let mut decoder = EnvelopeDecoder::new(limits.max_receive_bytes());
        let mut body = body;

        loop {
            loop {
                let frame = match decoder.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                let payload = match open_frame(frame, request_encoding) {
                    Ok(Some(payload)) => payload,
                    // End-of-stream from the client: the input is done.
                    Ok(None) => return,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                if let Err(msg) = limits.check_size(payload.len()) {
                    yield Err(ConnectError::new(Code::ResourceExhausted, msg));
                    return;
                }
                yield decode_message(protocol, &payload);
            }

            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        decoder.push(data);
                    }
                }
                Some(Err(err)) => {
                    rctx.cancel();
                    yield Err(ConnectError::new(
                        Code::Unknown,
                        format!("read enveloped message: {err}"),
                    ));
                    return;
                }
                None => {
                    if let Err(err) = decoder.finish() {
                        rctx.cancel();
                        yield Err(err);
                    }
                    return;
                }
            }
        }
    };

    Streaming::new(Box::pin(stream))
}

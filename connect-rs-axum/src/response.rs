//! Response building: unary bodies, framed streams, and error responses.

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use connect_rs_core::{
    Code, ConnectError, RpcContentType, STREAM_ENCODING_HEADER, encode_message, end_stream_json,
    error_json_bytes, maybe_compress, wrap_end_stream, wrap_envelope,
};
use futures::{Stream, StreamExt};
use http::HeaderMap;
use prost::Message;
use serde::Serialize;

use crate::context::{ConnectContext, RequestContext};

/// Build the HTTP response for an error, honoring the protocol family.
///
/// Unary errors carry the mapped HTTP status and a JSON body; streaming
/// errors are an HTTP 200 whose body is a single end-of-stream envelope.
pub fn error_response(protocol: RpcContentType, err: ConnectError) -> Response {
    if protocol.is_streaming() {
        return streaming_error_response(protocol, err);
    }

    let status = err.code().http_status();
    let meta = err.meta().clone();
    let body = error_json_bytes(&err);

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static(protocol.error_content_type()))
        .body(Body::from(body))
        .unwrap_or_else(|_| fallback_unary_error());
    response
        .headers_mut()
        .extend(meta.iter().map(|(k, v)| (k.clone(), v.clone())));
    response
}

fn streaming_error_response(protocol: RpcContentType, err: ConnectError) -> Response {
    let frame = wrap_end_stream(&end_stream_json(Some(&err), None));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HeaderValue::from_static(protocol.error_content_type()))
        .body(Body::from(frame))
        .unwrap_or_else(|_| fallback_unary_error())
}

// Hardcoded last resort when even the response builder fails.
fn fallback_unary_error() -> Response {
    let mut response = Response::new(Body::from(
        &br#"{"code":"internal","message":"response construction failed"}"#[..],
    ));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

/// Merge handler-set response headers, and trailers as `trailer-`-prefixed
/// headers (the unary rendition of trailing metadata).
fn apply_response_metadata(response: &mut Response, rctx: &RequestContext) {
    let headers = rctx.take_response_headers();
    response
        .headers_mut()
        .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));

    let trailers = rctx.take_response_trailers();
    for (name, value) in trailers.iter() {
        if let Ok(prefixed) = http::HeaderName::try_from(format!("trailer-{}", name.as_str())) {
            response.headers_mut().append(prefixed, value.clone());
        }
    }
}

/// Encode a unary response message.
pub fn unary_response<T>(ctx: &ConnectContext, rctx: &RequestContext, message: &T) -> Response
where
    T: Message + Serialize,
{
    let body = match encode_message(ctx.protocol, message) {
        Ok(body) => body,
        Err(err) => return error_response(ctx.protocol, err),
    };
    let (body, compressed) = maybe_compress(body, ctx.response_encoding, &ctx.compression);

    let mut builder = Response::builder().status(StatusCode::OK).header(
        header::CONTENT_TYPE,
        HeaderValue::from_static(ctx.protocol.response_content_type()),
    );
    if compressed {
        builder = builder.header(
            header::CONTENT_ENCODING,
            HeaderValue::from_static(ctx.response_encoding.as_str()),
        );
    }

    let mut response = builder
        .body(Body::from(body))
        .unwrap_or_else(|_| fallback_unary_error());
    apply_response_metadata(&mut response, rctx);
    response
}

/// Encode a single message as a framed response (client-streaming replies):
/// one data envelope followed by the end-of-stream envelope.
pub fn stream_single_response<T>(ctx: &ConnectContext, rctx: &RequestContext, message: &T) -> Response
where
    T: Message + Serialize,
{
    let protocol = ctx.protocol.streaming_variant();
    let payload = match encode_message(protocol, message) {
        Ok(payload) => payload,
        Err(err) => return error_response(protocol, err),
    };
    let (payload, compressed) = maybe_compress(payload, ctx.response_encoding, &ctx.compression);

    let trailers = rctx.take_response_trailers();
    let mut body = wrap_envelope(&payload, compressed);
    body.extend_from_slice(&wrap_end_stream(&end_stream_json(
        None,
        non_empty(&trailers),
    )));

    let mut response = stream_response_builder(protocol, ctx)
        .body(Body::from(body))
        .unwrap_or_else(|_| fallback_unary_error());
    apply_stream_headers(&mut response, rctx);
    response
}

/// Cancels the shared request context when the response body is dropped
/// before the end-of-stream frame was written: the peer went away.
struct FlushGuard {
    ctx: RequestContext,
    finished: bool,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.ctx.cancel();
        }
    }
}

/// Encode a message stream as a framed response body.
///
/// Each element is encoded, optionally compressed per-frame, and framed; the
/// body terminates with exactly one end-of-stream envelope carrying either
/// `{}` plus trailers or the handler's error. Deadline expiry turns into an
/// in-band `deadline_exceeded`; a peer abort (the body dropped mid-stream)
/// cancels the request context so the handler's input side stops too.
pub fn stream_response<S, T>(ctx: &ConnectContext, rctx: &RequestContext, stream: S) -> Response
where
    S: Stream<Item = Result<T, ConnectError>> + Send + 'static,
    T: Message + Serialize + Send + 'static,
{
    let protocol = ctx.protocol.streaming_variant();
    let response_encoding = ctx.response_encoding;
    let compression = ctx.compression;
    let flush_ctx = rctx.clone();

    let body_stream = async_stream::stream! {
        let mut guard = FlushGuard {
            ctx: flush_ctx.clone(),
            finished: false,
        };
        let mut stream = std::pin::pin!(stream);
        loop {
            if flush_ctx.is_canceled() {
                let err = match flush_ctx.time_remaining() {
                    Some(remaining) if remaining.is_zero() => {
                        ConnectError::new(Code::DeadlineExceeded, "request timed out")
                    }
                    _ => ConnectError::canceled("request canceled"),
                };
                yield Ok::<_, std::convert::Infallible>(end_frame(&flush_ctx, Some(err)));
                guard.finished = true;
                return;
            }
            match stream.next().await {
                Some(Ok(message)) => {
                    let payload = match encode_message(protocol, &message) {
                        Ok(payload) => payload,
                        Err(err) => {
                            yield Ok(end_frame(&flush_ctx, Some(err)));
                            guard.finished = true;
                            return;
                        }
                    };
                    let (payload, compressed) =
                        maybe_compress(payload, response_encoding, &compression);
                    yield Ok(Bytes::from(wrap_envelope(&payload, compressed)));
                }
                Some(Err(err)) => {
                    yield Ok(end_frame(&flush_ctx, Some(err)));
                    guard.finished = true;
                    return;
                }
                None => {
                    yield Ok(end_frame(&flush_ctx, None));
                    guard.finished = true;
                    return;
                }
            }
        }
    };

    let mut response = stream_response_builder(protocol, ctx)
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| fallback_unary_error());
    apply_stream_headers(&mut response, rctx);
    response
}

/// Build the terminal end-of-stream frame, folding in whatever trailers the
/// handler left on the context at flush time.
fn end_frame(rctx: &RequestContext, error: Option<ConnectError>) -> Bytes {
    let trailers = rctx.take_response_trailers();
    Bytes::from(wrap_end_stream(&end_stream_json(
        error.as_ref(),
        non_empty(&trailers),
    )))
}

fn non_empty(trailers: &HeaderMap) -> Option<&HeaderMap> {
    if trailers.is_empty() { None } else { Some(trailers) }
}

fn stream_response_builder(
    protocol: RpcContentType,
    ctx: &ConnectContext,
) -> http::response::Builder {
    let mut builder = Response::builder().status(StatusCode::OK).header(
        header::CONTENT_TYPE,
        HeaderValue::from_static(protocol.response_content_type()),
    );
    if !ctx.response_encoding.is_identity() {
        builder = builder.header(
            STREAM_ENCODING_HEADER,
            HeaderValue::from_static(ctx.response_encoding.as_str()),
        );
    }
    builder
}

fn apply_stream_headers(response: &mut Response, rctx: &RequestContext) {
    let headers = rctx.take_response_headers();
    response
        .headers_mut()
        .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_rs_core::{IdempotencyLevel, MethodSpec, RpcKind};
    use http_body_util::BodyExt;

    fn rctx() -> RequestContext {
        RequestContext::new(
            MethodSpec::new("pkg.Svc", "Echo", RpcKind::Unary, IdempotencyLevel::Unknown),
            HeaderMap::new(),
            None,
            None,
        )
    }

    #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
    struct Note {
        #[prost(string, tag = "1")]
        text: String,
    }

    #[tokio::test]
    async fn unary_error_response_shape() {
        let err = ConnectError::invalid_argument("inches: too small");
        let response = error_response(RpcContentType::UnaryJson, err);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "invalid_argument");
        assert_eq!(json["message"], "inches: too small");
    }

    #[tokio::test]
    async fn streaming_error_is_http_200_with_end_stream_frame() {
        let err = ConnectError::permission_denied("no");
        let response = error_response(RpcContentType::StreamProto, err);
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body[0], connect_rs_core::flags::END_STREAM);
        let json: serde_json::Value = serde_json::from_slice(&body[5..]).unwrap();
        assert_eq!(json["code"], "permission_denied");
    }

    #[tokio::test]
    async fn unary_response_echoes_content_type_and_metadata() {
        let ctx = ConnectContext {
            protocol: RpcContentType::UnaryProto,
            ..ConnectContext::default()
        };
        let rctx = rctx();
        rctx.response_headers()
            .insert("x-extra", HeaderValue::from_static("1"));
        rctx.response_trailers()
            .insert("checksum", HeaderValue::from_static("abc"));

        let response = unary_response(&ctx, &rctx, &Note { text: "hi!".into() });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/proto"
        );
        assert_eq!(response.headers().get("x-extra").unwrap(), "1");
        assert_eq!(response.headers().get("trailer-checksum").unwrap(), "abc");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let decoded = <Note as prost::Message>::decode(&body[..]).unwrap();
        assert_eq!(decoded.text, "hi!");
    }

    #[tokio::test]
    async fn stream_response_frames_messages_then_end_stream() {
        let ctx = ConnectContext {
            protocol: RpcContentType::StreamProto,
            ..ConnectContext::default()
        };
        let messages = futures::stream::iter(vec![
            Ok(Note { text: "a".into() }),
            Ok(Note { text: "b".into() }),
            Ok(Note { text: "c".into() }),
        ]);
        let response = stream_response(&ctx, &rctx(), messages);
        let body = response.into_body().collect().await.unwrap().to_bytes();

        let mut decoder = connect_rs_core::EnvelopeDecoder::new(None);
        decoder.push(&body);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 4);
        for frame in &frames[..3] {
            assert_eq!(frame.flags, connect_rs_core::flags::MESSAGE);
        }
        assert!(frames[3].is_end_stream());
        assert_eq!(&frames[3].payload[..], b"{}");
    }

    #[tokio::test]
    async fn stream_response_emits_error_end_stream_and_stops() {
        let ctx = ConnectContext {
            protocol: RpcContentType::StreamJson,
            ..ConnectContext::default()
        };
        let messages = futures::stream::iter(vec![
            Ok(Note { text: "one".into() }),
            Err(ConnectError::permission_denied("denied")),
            Ok(Note { text: "never".into() }),
        ]);
        let response = stream_response(&ctx, &rctx(), messages);
        let body = response.into_body().collect().await.unwrap().to_bytes();

        let mut decoder = connect_rs_core::EnvelopeDecoder::new(None);
        decoder.push(&body);
        let first = decoder.next_frame().unwrap().unwrap();
        assert!(!first.is_end_stream());
        let second = decoder.next_frame().unwrap().unwrap();
        assert!(second.is_end_stream());
        let json: serde_json::Value = serde_json::from_slice(&second.payload).unwrap();
        assert_eq!(json["code"], "permission_denied");
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.finish().unwrap();
    }

    #[tokio::test]
    async fn dropping_the_body_mid_stream_cancels_the_context() {
        let ctx = ConnectContext {
            protocol: RpcContentType::StreamProto,
            ..ConnectContext::default()
        };
        let rctx = rctx();
        let messages = futures::stream::iter(vec![Ok(Note { text: "a".into() })])
            .chain(futures::stream::pending::<Result<Note, ConnectError>>());

        let response = stream_response(&ctx, &rctx, messages);
        let mut body = response.into_body();
        let first = body.frame().await.unwrap().unwrap();
        assert!(first.data_ref().is_some());
        assert!(!rctx.is_canceled());

        drop(body);
        assert!(rctx.is_canceled());
    }

    #[tokio::test]
    async fn stream_single_response_is_one_message_plus_end_stream() {
        let ctx = ConnectContext {
            protocol: RpcContentType::StreamProto,
            ..ConnectContext::default()
        };
        let response = stream_single_response(&ctx, &rctx(), &Note { text: "sum".into() });
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/connect+proto"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let mut decoder = connect_rs_core::EnvelopeDecoder::new(None);
        decoder.push(&body);
        let msg = decoder.next_frame().unwrap().unwrap();
        assert!(!msg.is_end_stream());
        let eos = decoder.next_frame().unwrap().unwrap();
        assert!(eos.is_end_stream());
    }
}

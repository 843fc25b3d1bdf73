//! End-to-end tests driving the full router through `tower::ServiceExt`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use base64::Engine;
use connect_rs_axum::prelude::*;
use connect_rs_axum::{MakeServiceBuilder, RequestContext, Streaming, handler};
use connect_rs_core::{IdempotencyLevel, MethodSpec, RpcKind, flags};
use futures::StreamExt;
use http_body_util::BodyExt;
use prost::Message;
use tower::ServiceExt;

#[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
struct EchoRequest {
    #[prost(string, tag = "1")]
    message: String,
}

#[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
struct EchoResponse {
    #[prost(string, tag = "1")]
    reply: String,
}

#[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
struct Measure {
    #[prost(int64, tag = "1")]
    inches: i64,
}

const ECHO: MethodSpec = MethodSpec::new("pkg.Svc", "Echo", RpcKind::Unary, IdempotencyLevel::Unknown);
const GET: MethodSpec = MethodSpec::new(
    "pkg.Svc",
    "Get",
    RpcKind::Unary,
    IdempotencyLevel::NoSideEffects,
);
const CONVERT: MethodSpec =
    MethodSpec::new("pkg.Svc", "Convert", RpcKind::Unary, IdempotencyLevel::Unknown);
const WATCH: MethodSpec = MethodSpec::new(
    "pkg.Svc",
    "Watch",
    RpcKind::ServerStream,
    IdempotencyLevel::Unknown,
);
const CHAT: MethodSpec =
    MethodSpec::new("pkg.Svc", "Chat", RpcKind::BidiStream, IdempotencyLevel::Unknown);
const SLEEP: MethodSpec =
    MethodSpec::new("pkg.Svc", "Sleep", RpcKind::Unary, IdempotencyLevel::Unknown);

fn app() -> Router {
    let services = Router::new()
        .route(
            "/pkg.Svc/Echo",
            handler::unary(ECHO, |_ctx, req: EchoRequest| async move {
                Ok(EchoResponse {
                    reply: format!("{}!", req.message),
                })
            }),
        )
        .route(
            "/pkg.Svc/Get",
            handler::unary(GET, |_ctx, req: EchoRequest| async move {
                Ok(EchoResponse { reply: req.message })
            }),
        )
        .route(
            "/pkg.Svc/Convert",
            handler::unary(CONVERT, |_ctx, req: Measure| async move {
                if req.inches < 0 {
                    return Err(ConnectError::invalid_argument("inches: too small"));
                }
                Ok(Measure {
                    inches: req.inches * 2,
                })
            }),
        )
        .route(
            "/pkg.Svc/Watch",
            handler::server_stream(WATCH, |_ctx, req: EchoRequest| async move {
                Ok(futures::stream::iter((1..=3).map(move |n| {
                    Ok(EchoResponse {
                        reply: format!("{} #{n}", req.message),
                    })
                })))
            }),
        )
        .route(
            "/pkg.Svc/Chat",
            handler::bidi_stream(CHAT, |_ctx, incoming: Streaming<EchoRequest>| async move {
                Ok(async_stream::stream! {
                    let mut incoming = std::pin::pin!(incoming);
                    let mut yielded = false;
                    while let Some(msg) = incoming.next().await {
                        match msg {
                            Ok(msg) if yielded => {
                                let _ = msg;
                                yield Err(ConnectError::permission_denied(
                                    "second message refused",
                                ));
                                return;
                            }
                            Ok(msg) => {
                                yielded = true;
                                yield Ok(EchoResponse { reply: msg.message });
                            }
                            Err(err) => {
                                yield Err(err);
                                return;
                            }
                        }
                    }
                })
            }),
        );
    MakeServiceBuilder::new().add_router(services).build()
}

fn post(path: &str, content_type: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

async fn frames(body: Body) -> Vec<connect_rs_core::Frame> {
    let bytes = body.collect().await.unwrap().to_bytes();
    let mut decoder = connect_rs_core::EnvelopeDecoder::new(None);
    decoder.push(&bytes);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame().unwrap() {
        frames.push(frame);
    }
    decoder.finish().unwrap();
    frames
}

#[tokio::test]
async fn unary_proto_post_success() {
    let request = post(
        "/pkg.Svc/Echo",
        "application/proto",
        EchoRequest { message: "hi".into() }.encode_to_vec(),
    );
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/proto"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let reply = EchoResponse::decode(&body[..]).unwrap();
    assert_eq!(reply.reply, "hi!");
}

#[tokio::test]
async fn unary_json_post_handler_error() {
    let request = post(
        "/pkg.Svc/Convert",
        "application/json",
        br#"{"inches":-1}"#.to_vec(),
    );
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"code": "invalid_argument", "message": "inches: too small"})
    );
}

#[tokio::test]
async fn unary_get_allowed_for_no_side_effects() {
    let message = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(EchoRequest { message: "seven".into() }.encode_to_vec());
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!(
            "/pkg.Svc/Get?connect=v1&encoding=proto&message={message}"
        ))
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/proto"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(EchoResponse::decode(&body[..]).unwrap().reply, "seven");
}

#[tokio::test]
async fn unary_get_forbidden_without_no_side_effects() {
    let request = Request::builder()
        .method(Method::GET)
        .uri("/pkg.Svc/Echo?connect=v1&encoding=proto&message=AA")
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    assert_eq!(response.headers().get(header::ALLOW).unwrap(), "POST");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"code": "unimplemented", "message": "GET not allowed"})
    );
}

#[tokio::test]
async fn server_streaming_success() {
    let mut body = connect_rs_core::wrap_envelope(
        &EchoRequest { message: "tick".into() }.encode_to_vec(),
        false,
    );
    body.extend_from_slice(&connect_rs_core::wrap_end_stream(b"{}"));
    let request = post("/pkg.Svc/Watch", "application/connect+proto", body);
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/connect+proto"
    );
    let frames = frames(response.into_body()).await;
    assert_eq!(frames.len(), 4);
    for (i, frame) in frames[..3].iter().enumerate() {
        assert_eq!(frame.flags, flags::MESSAGE);
        let msg = EchoResponse::decode(&frame.payload[..]).unwrap();
        assert_eq!(msg.reply, format!("tick #{}", i + 1));
    }
    assert_eq!(frames[3].flags, flags::END_STREAM);
    assert_eq!(&frames[3].payload[..], b"{}");
}

#[tokio::test]
async fn bidi_streaming_handler_error() {
    let mut body = Vec::new();
    for text in ["one", "two"] {
        body.extend_from_slice(&connect_rs_core::wrap_envelope(
            &EchoRequest { message: text.into() }.encode_to_vec(),
            false,
        ));
    }
    body.extend_from_slice(&connect_rs_core::wrap_end_stream(b"{}"));
    let request = post("/pkg.Svc/Chat", "application/connect+proto", body);
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let frames = frames(response.into_body()).await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].flags, flags::MESSAGE);
    assert_eq!(
        EchoResponse::decode(&frames[0].payload[..]).unwrap().reply,
        "one"
    );
    assert!(frames[1].is_end_stream());
    let json: serde_json::Value = serde_json::from_slice(&frames[1].payload).unwrap();
    assert_eq!(json["code"], "permission_denied");
    assert!(json["message"].as_str().unwrap().contains("refused"));
}

#[tokio::test]
async fn timeout_cancels_the_handler() {
    let captured: Arc<Mutex<Option<RequestContext>>> = Arc::new(Mutex::new(None));
    let captured_in_handler = captured.clone();
    let app = MakeServiceBuilder::new()
        .add_router(Router::new().route(
            "/pkg.Svc/Sleep",
            handler::unary(SLEEP, move |ctx, _req: EchoRequest| {
                let captured = captured_in_handler.clone();
                async move {
                    *captured.lock().unwrap() = Some(ctx.clone());
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(EchoResponse { reply: "late".into() })
                }
            }),
        ))
        .build();

    let mut request = post(
        "/pkg.Svc/Sleep",
        "application/proto",
        EchoRequest { message: "zzz".into() }.encode_to_vec(),
    );
    request.headers_mut().insert(
        connect_rs_core::TIMEOUT_HEADER,
        header::HeaderValue::from_static("50"),
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], "deadline_exceeded");

    // The handler observed the same deadline: its context reports
    // cancellation even though the handler itself never finished.
    let ctx = captured.lock().unwrap().take().unwrap();
    assert!(ctx.is_canceled());
}

#[tokio::test]
async fn parallel_requests_do_not_share_context() {
    let app = MakeServiceBuilder::new()
        .add_router(Router::new().route(
            "/pkg.Svc/Echo",
            handler::unary(ECHO, |ctx, req: EchoRequest| async move {
                ctx.response_headers().insert(
                    "x-echo",
                    header::HeaderValue::from_str(&req.message).unwrap(),
                );
                Ok(EchoResponse { reply: req.message })
            }),
        ))
        .build();

    let mut handles = Vec::new();
    for i in 0..8 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let message = format!("req-{i}");
            let request = post(
                "/pkg.Svc/Echo",
                "application/proto",
                EchoRequest { message: message.clone() }.encode_to_vec(),
            );
            let response = app.oneshot(request).await.unwrap();
            let echoed = response
                .headers()
                .get("x-echo")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            assert_eq!(echoed.as_deref(), Some(message.as_str()));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn bad_protocol_version_is_rejected() {
    let app = MakeServiceBuilder::new().build();
    let mut request = post("/pkg.Svc/Echo", "application/json", vec![]);
    request.headers_mut().insert(
        connect_rs_core::PROTOCOL_VERSION_HEADER,
        header::HeaderValue::from_static("2"),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], "invalid_argument");
}

#[tokio::test]
async fn gzip_request_body_is_decompressed() {
    use connect_rs_core::CompressionCodec;
    let codec = connect_rs_core::GzipCompression::default();
    let compressed = codec
        .compress(&EchoRequest { message: "zip".into() }.encode_to_vec())
        .unwrap();

    let mut request = post("/pkg.Svc/Echo", "application/proto", compressed.to_vec());
    request.headers_mut().insert(
        header::CONTENT_ENCODING,
        header::HeaderValue::from_static("gzip"),
    );
    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(EchoResponse::decode(&body[..]).unwrap().reply, "zip!");
}

//! Route constructors for the four RPC shapes.
//!
//! Each constructor takes a [`MethodSpec`] and a handler function and returns
//! an axum [`MethodRouter`] that decodes the request, builds the
//! [`RequestContext`], invokes the handler, and encodes the result. HTTP
//! methods outside the method's allowed set answer 501 with an `Allow`
//! header.

use std::future::Future;

use axum::extract::Request;
use axum::http::{HeaderValue, Method, header};
use axum::response::Response;
use axum::routing::MethodRouter;
use connect_rs_core::{ConnectError, MethodSpec, RpcContentType};
use futures::Stream;
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::{ConnectContext, RequestContext};
use crate::request::{
    Streaming, extract_stream_single, extract_streaming, extract_unary_get, extract_unary_post,
    get_context_or_default,
};
use crate::response::{error_response, stream_response, stream_single_response, unary_response};

/// Register a unary handler.
///
/// GET is additionally routed when the method is marked `no_side_effects`.
pub fn unary<Req, Resp, F, Fut>(spec: MethodSpec, handler: F) -> MethodRouter
where
    Req: Message + DeserializeOwned + Default + Send + Sync + 'static,
    Resp: Message + Serialize + Send + Sync + 'static,
    F: Fn(RequestContext, Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, ConnectError>> + Send + 'static,
{
    let serve = move |req: Request| {
        let handler = handler.clone();
        async move { serve_unary(spec, handler, req).await }
    };

    let mut router = axum::routing::post(serve.clone());
    if spec.allows_get() {
        router = router.get(serve);
    }
    router.fallback(method_fallback(spec))
}

async fn serve_unary<Req, Resp, F, Fut>(spec: MethodSpec, handler: F, req: Request) -> Response
where
    Req: Message + DeserializeOwned + Default + Send + Sync + 'static,
    Resp: Message + Serialize + Send + Sync + 'static,
    F: Fn(RequestContext, Req) -> Fut,
    Fut: Future<Output = Result<Resp, ConnectError>> + Send + 'static,
{
    let ctx = get_context_or_default(&req);
    if let Err(err) = expect_family(&ctx, false) {
        return error_response(ctx.protocol, err);
    }

    let rctx = request_context(spec, &ctx, &req);
    let message = if *req.method() == Method::GET {
        extract_unary_get(&ctx, &req)
    } else {
        extract_unary_post(&ctx, req).await
    };
    let message = match message {
        Ok(message) => message,
        Err(err) => return error_response(ctx.protocol, err),
    };

    match handler(rctx.clone(), message).await {
        Ok(response) => unary_response(&ctx, &rctx, &response),
        Err(err) => error_response(ctx.protocol, err),
    }
}

/// Register a server-streaming handler: single request in, message stream
/// out.
pub fn server_stream<Req, Resp, St, F, Fut>(spec: MethodSpec, handler: F) -> MethodRouter
where
    Req: Message + DeserializeOwned + Default + Send + Sync + 'static,
    Resp: Message + Serialize + Send + Sync + 'static,
    St: Stream<Item = Result<Resp, ConnectError>> + Send + 'static,
    F: Fn(RequestContext, Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<St, ConnectError>> + Send + 'static,
{
    let serve = move |req: Request| {
        let handler = handler.clone();
        async move {
            let ctx = get_context_or_default(&req);
            if let Err(err) = expect_family(&ctx, true) {
                return error_response(ctx.protocol, err);
            }

            let rctx = request_context(spec, &ctx, &req);
            let message = match extract_stream_single(&ctx, req).await {
                Ok(message) => message,
                Err(err) => return error_response(ctx.protocol, err),
            };

            match handler(rctx.clone(), message).await {
                Ok(stream) => stream_response(&ctx, &rctx, stream),
                Err(err) => error_response(ctx.protocol, err),
            }
        }
    };

    axum::routing::post(serve).fallback(method_fallback(spec))
}

/// Register a client-streaming handler: message stream in, single response
/// out (framed, since the content type is `application/connect+*`).
pub fn client_stream<Req, Resp, F, Fut>(spec: MethodSpec, handler: F) -> MethodRouter
where
    Req: Message + DeserializeOwned + Default + Send + Sync + 'static,
    Resp: Message + Serialize + Send + Sync + 'static,
    F: Fn(RequestContext, Streaming<Req>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, ConnectError>> + Send + 'static,
{
    let serve = move |req: Request| {
        let handler = handler.clone();
        async move {
            let ctx = get_context_or_default(&req);
            if let Err(err) = expect_family(&ctx, true) {
                return error_response(ctx.protocol, err);
            }

            let rctx = request_context(spec, &ctx, &req);
            let streaming = extract_streaming(&ctx, &rctx, req);

            match handler(rctx.clone(), streaming).await {
                Ok(response) => stream_single_response(&ctx, &rctx, &response),
                Err(err) => error_response(ctx.protocol, err),
            }
        }
    };

    axum::routing::post(serve).fallback(method_fallback(spec))
}

/// Register a bidirectional-streaming handler: message stream in, message
/// stream out.
///
/// Full- vs half-duplex is the handler's choice: a half-duplex handler drains
/// the input before returning its stream; a full-duplex handler returns a
/// stream that still holds the input and interleaves reads with writes. The
/// hyper body model runs the two directions as independent tasks with their
/// own flow control, so no ordering holds between them.
pub fn bidi_stream<Req, Resp, St, F, Fut>(spec: MethodSpec, handler: F) -> MethodRouter
where
    Req: Message + DeserializeOwned + Default + Send + Sync + 'static,
    Resp: Message + Serialize + Send + Sync + 'static,
    St: Stream<Item = Result<Resp, ConnectError>> + Send + 'static,
    F: Fn(RequestContext, Streaming<Req>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<St, ConnectError>> + Send + 'static,
{
    let serve = move |req: Request| {
        let handler = handler.clone();
        async move {
            let ctx = get_context_or_default(&req);
            if let Err(err) = expect_family(&ctx, true) {
                return error_response(ctx.protocol, err);
            }

            let rctx = request_context(spec, &ctx, &req);
            let streaming = extract_streaming(&ctx, &rctx, req);

            match handler(rctx.clone(), streaming).await {
                Ok(stream) => stream_response(&ctx, &rctx, stream),
                Err(err) => error_response(ctx.protocol, err),
            }
        }
    };

    axum::routing::post(serve).fallback(method_fallback(spec))
}

/// Reject content types from the wrong protocol family with
/// `invalid_argument`.
fn expect_family(ctx: &ConnectContext, streaming: bool) -> Result<(), ConnectError> {
    if streaming && ctx.protocol.is_unary() {
        return Err(ConnectError::invalid_argument(
            "streaming endpoints require an application/connect+* content-type",
        ));
    }
    if !streaming && ctx.protocol.is_streaming() {
        return Err(ConnectError::invalid_argument(
            "unary endpoints require application/proto or application/json",
        ));
    }
    Ok(())
}

fn request_context(spec: MethodSpec, ctx: &ConnectContext, req: &Request) -> RequestContext {
    let peer = req
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0);
    RequestContext::new(spec, req.headers().clone(), ctx.timeout, peer)
}

/// Fallback for HTTP methods outside the allowed set: 501 with an `Allow`
/// header.
fn method_fallback(
    spec: MethodSpec,
) -> impl Fn(Request) -> std::pin::Pin<Box<dyn Future<Output = Response> + Send>> + Clone + Send + 'static
{
    move |req: Request| {
        Box::pin(async move {
            let err = ConnectError::unimplemented(format!("{} not allowed", req.method()));
            let mut response = error_response(RpcContentType::UnaryJson, err);
            if let Ok(allow) = HeaderValue::from_str(spec.allowed_methods()) {
                response.headers_mut().insert(header::ALLOW, allow);
            }
            response
        })
    }
}

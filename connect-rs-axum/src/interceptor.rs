//! Server-side interceptors.
//!
//! One interceptor trait exists per RPC shape, each wrapping a typed `next`
//! function that runs after request decoding and before response encoding.
//! Chains are ordered lists composed once at construction:
//! `[I1, I2, I3]` produces `I1.wrap(I2.wrap(I3.wrap(handler)))`, so work
//! before `next` runs outer-to-inner and work after `next` inner-to-outer.
//!
//! [`MetadataInterceptor`] is the simpler hook — `on_start` / `on_end` around
//! the handler, with a state value threaded between them — and adapts to all
//! four shapes through [`MetadataAdapter`].

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use connect_rs_core::ConnectError;
use futures::Stream;

use crate::context::RequestContext;
use crate::request::Streaming;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed response stream, as produced by server-streaming and bidi
/// handlers.
pub type BoxMessageStream<T> = Pin<Box<dyn Stream<Item = Result<T, ConnectError>> + Send>>;

/// The continuation of a unary call.
pub type UnaryNext<Req, Resp> =
    Arc<dyn Fn(RequestContext, Req) -> BoxFuture<'static, Result<Resp, ConnectError>> + Send + Sync>;

/// The continuation of a server-streaming call.
pub type ServerStreamNext<Req, Resp> = Arc<
    dyn Fn(RequestContext, Req) -> BoxFuture<'static, Result<BoxMessageStream<Resp>, ConnectError>>
        + Send
        + Sync,
>;

/// The continuation of a client-streaming call.
pub type ClientStreamNext<Req, Resp> = Arc<
    dyn Fn(RequestContext, Streaming<Req>) -> BoxFuture<'static, Result<Resp, ConnectError>>
        + Send
        + Sync,
>;

/// The continuation of a bidirectional-streaming call.
pub type BidiNext<Req, Resp> = Arc<
    dyn Fn(
            RequestContext,
            Streaming<Req>,
        ) -> BoxFuture<'static, Result<BoxMessageStream<Resp>, ConnectError>>
        + Send
        + Sync,
>;

pub trait UnaryInterceptor<Req, Resp>: Send + Sync {
    fn wrap(&self, next: UnaryNext<Req, Resp>) -> UnaryNext<Req, Resp>;
}

pub trait ServerStreamInterceptor<Req, Resp>: Send + Sync {
    fn wrap(&self, next: ServerStreamNext<Req, Resp>) -> ServerStreamNext<Req, Resp>;
}

pub trait ClientStreamInterceptor<Req, Resp>: Send + Sync {
    fn wrap(&self, next: ClientStreamNext<Req, Resp>) -> ClientStreamNext<Req, Resp>;
}

pub trait BidiInterceptor<Req, Resp>: Send + Sync {
    fn wrap(&self, next: BidiNext<Req, Resp>) -> BidiNext<Req, Resp>;
}

macro_rules! define_chain {
    ($name:ident, $trait_:ident, $next:ident) => {
        /// An ordered, immutable-after-construction interceptor list.
        pub struct $name<Req, Resp> {
            interceptors: Vec<Arc<dyn $trait_<Req, Resp>>>,
        }

        impl<Req, Resp> $name<Req, Resp> {
            pub fn new() -> Self {
                Self {
                    interceptors: Vec::new(),
                }
            }

            pub fn with(mut self, interceptor: Arc<dyn $trait_<Req, Resp>>) -> Self {
                self.interceptors.push(interceptor);
                self
            }

            pub fn is_empty(&self) -> bool {
                self.interceptors.is_empty()
            }

            pub fn len(&self) -> usize {
                self.interceptors.len()
            }

            /// Compose the chain around a terminal continuation. Applied in
            /// reverse so the first interceptor added is outermost.
            pub fn wrap(&self, next: $next<Req, Resp>) -> $next<Req, Resp> {
                let mut wrapped = next;
                for interceptor in self.interceptors.iter().rev() {
                    wrapped = interceptor.wrap(wrapped);
                }
                wrapped
            }
        }

        impl<Req, Resp> Default for $name<Req, Resp> {
            fn default() -> Self {
                Self::new()
            }
        }

        impl<Req, Resp> Clone for $name<Req, Resp> {
            fn clone(&self) -> Self {
                Self {
                    interceptors: self.interceptors.clone(),
                }
            }
        }
    };
}

define_chain!(UnaryChain, UnaryInterceptor, UnaryNext);
define_chain!(ServerStreamChain, ServerStreamInterceptor, ServerStreamNext);
define_chain!(ClientStreamChain, ClientStreamInterceptor, ClientStreamNext);
define_chain!(BidiChain, BidiInterceptor, BidiNext);

/// Lift a plain async handler into a [`UnaryNext`] so a chain can wrap it.
pub fn unary_next<Req, Resp, F, Fut>(handler: F) -> UnaryNext<Req, Resp>
where
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, ConnectError>> + Send + 'static,
{
    Arc::new(move |ctx, req| Box::pin(handler(ctx, req)))
}

/// Lift a plain async client-streaming handler into a [`ClientStreamNext`].
pub fn client_stream_next<Req, Resp, F, Fut>(handler: F) -> ClientStreamNext<Req, Resp>
where
    F: Fn(RequestContext, Streaming<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, ConnectError>> + Send + 'static,
{
    Arc::new(move |ctx, req| Box::pin(handler(ctx, req)))
}

/// The simpler interceptor shape: observe the context before the handler and
/// after it, threading a state value between the two hooks.
///
/// For streaming shapes, `on_end` fires when the handler returns its stream,
/// not when the stream is drained.
pub trait MetadataInterceptor: Send + Sync + 'static {
    fn on_start(&self, ctx: &RequestContext) -> Box<dyn Any + Send>;

    fn on_end(&self, state: Box<dyn Any + Send>, ctx: &RequestContext);
}

/// Adapts a [`MetadataInterceptor`] to every kind-specific interceptor trait.
pub struct MetadataAdapter<I>(Arc<I>);

impl<I: MetadataInterceptor> MetadataAdapter<I> {
    pub fn new(interceptor: I) -> Self {
        Self(Arc::new(interceptor))
    }
}

impl<I> Clone for MetadataAdapter<I> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<I, Req, Resp> UnaryInterceptor<Req, Resp> for MetadataAdapter<I>
where
    I: MetadataInterceptor,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: UnaryNext<Req, Resp>) -> UnaryNext<Req, Resp> {
        let interceptor = self.0.clone();
        Arc::new(move |ctx, req| {
            let interceptor = interceptor.clone();
            let next = next.clone();
            Box::pin(async move {
                let state = interceptor.on_start(&ctx);
                let result = next(ctx.clone(), req).await;
                interceptor.on_end(state, &ctx);
                result
            })
        })
    }
}

impl<I, Req, Resp> ServerStreamInterceptor<Req, Resp> for MetadataAdapter<I>
where
    I: MetadataInterceptor,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: ServerStreamNext<Req, Resp>) -> ServerStreamNext<Req, Resp> {
        let interceptor = self.0.clone();
        Arc::new(move |ctx, req| {
            let interceptor = interceptor.clone();
            let next = next.clone();
            Box::pin(async move {
                let state = interceptor.on_start(&ctx);
                let result = next(ctx.clone(), req).await;
                interceptor.on_end(state, &ctx);
                result
            })
        })
    }
}

impl<I, Req, Resp> ClientStreamInterceptor<Req, Resp> for MetadataAdapter<I>
where
    I: MetadataInterceptor,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: ClientStreamNext<Req, Resp>) -> ClientStreamNext<Req, Resp> {
        let interceptor = self.0.clone();
        Arc::new(move |ctx, req| {
            let interceptor = interceptor.clone();
            let next = next.clone();
            Box::pin(async move {
                let state = interceptor.on_start(&ctx);
                let result = next(ctx.clone(), req).await;
                interceptor.on_end(state, &ctx);
                result
            })
        })
    }
}

impl<I, Req, Resp> BidiInterceptor<Req, Resp> for MetadataAdapter<I>
where
    I: MetadataInterceptor,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: BidiNext<Req, Resp>) -> BidiNext<Req, Resp> {
        let interceptor = self.0.clone();
        Arc::new(move |ctx, req| {
            let interceptor = interceptor.clone();
            let next = next.clone();
            Box::pin(async move {
                let state = interceptor.on_start(&ctx);
                let result = next(ctx.clone(), req).await;
                interceptor.on_end(state, &ctx);
                result
            })
        })
    }
}

//! Client-side interceptors.
//!
//! Interceptors wrap the serialized call: they run after message encoding and
//! before transport, so they can rewrite outgoing headers (and bodies) and
//! observe the raw response. Composition mirrors the server side:
//! `[I1, I2, I3]` wraps as `I1(I2(I3(transport)))`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use connect_rs_core::MethodSpec;
use http::HeaderMap;

use crate::error::ClientError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A serialized outbound call.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// The method being invoked.
    pub spec: MethodSpec,
    /// Outgoing headers, including the protocol defaults.
    pub headers: HeaderMap,
    /// Encoded (uncompressed) request message. Empty for calls whose body is
    /// streamed.
    pub body: Bytes,
}

/// A raw inbound response: headers plus the decompressed body.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The continuation of a unary call: the rest of the chain, ending at the
/// transport.
pub type UnaryFn =
    Arc<dyn Fn(RpcRequest) -> BoxFuture<'static, Result<RpcResponse, ClientError>> + Send + Sync>;

/// Handle for invoking the next element of the chain from an interceptor.
#[derive(Clone)]
pub struct UnaryNext {
    inner: UnaryFn,
}

impl UnaryNext {
    pub(crate) fn new(inner: UnaryFn) -> Self {
        Self { inner }
    }

    pub async fn call(self, request: RpcRequest) -> Result<RpcResponse, ClientError> {
        (self.inner)(request).await
    }
}

/// Cross-cutting logic around outbound calls.
pub trait Interceptor: Send + Sync {
    /// Wrap a unary call. The default passes through.
    fn wrap_unary(&self, next: UnaryFn) -> UnaryFn {
        next
    }

    /// Rewrite the headers of a streaming call before the stream opens.
    fn on_stream_request(&self, spec: &MethodSpec, headers: &mut HeaderMap) {
        let _ = (spec, headers);
    }
}

/// Ordered, immutable-after-construction interceptor list.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("count", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Compose around the transport; the first interceptor added sees the
    /// request first.
    pub fn wrap_unary(&self, next: UnaryFn) -> UnaryFn {
        let mut wrapped = next;
        for interceptor in self.interceptors.iter().rev() {
            wrapped = interceptor.wrap_unary(wrapped);
        }
        wrapped
    }

    /// Apply every interceptor's streaming-header hook in order.
    pub fn apply_stream_headers(&self, spec: &MethodSpec, headers: &mut HeaderMap) {
        for interceptor in &self.interceptors {
            interceptor.on_stream_request(spec, headers);
        }
    }
}

/// Adds one header to every call.
#[derive(Clone)]
pub struct HeaderInterceptor {
    name: http::HeaderName,
    value: http::HeaderValue,
}

impl HeaderInterceptor {
    pub fn new(name: &str, value: &str) -> Result<Self, ClientError> {
        let name = name
            .parse()
            .map_err(|_| ClientError::Protocol(format!("invalid header name: {name}")))?;
        let value = value
            .parse()
            .map_err(|_| ClientError::Protocol(format!("invalid header value: {value}")))?;
        Ok(Self { name, value })
    }

    pub fn from_parts(name: http::HeaderName, value: http::HeaderValue) -> Self {
        Self { name, value }
    }
}

impl Interceptor for HeaderInterceptor {
    fn wrap_unary(&self, next: UnaryFn) -> UnaryFn {
        let name = self.name.clone();
        let value = self.value.clone();
        Arc::new(move |mut request: RpcRequest| {
            request.headers.insert(name.clone(), value.clone());
            next(request)
        })
    }

    fn on_stream_request(&self, _spec: &MethodSpec, headers: &mut HeaderMap) {
        headers.insert(self.name.clone(), self.value.clone());
    }
}

/// Closure-based unary interceptor.
pub struct FnInterceptor<F> {
    func: F,
}

impl<F> FnInterceptor<F>
where
    F: Fn(RpcRequest, UnaryNext) -> BoxFuture<'static, Result<RpcResponse, ClientError>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    pub fn unary(func: F) -> Self {
        Self { func }
    }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(RpcRequest, UnaryNext) -> BoxFuture<'static, Result<RpcResponse, ClientError>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    fn wrap_unary(&self, next: UnaryFn) -> UnaryFn {
        let func = self.func.clone();
        Arc::new(move |request: RpcRequest| {
            let func = func.clone();
            let next = UnaryNext::new(next.clone());
            func(request, next)
        })
    }
}

impl<F: Clone> Clone for FnInterceptor<F> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_rs_core::{IdempotencyLevel, RpcKind};
    use std::sync::Mutex;

    fn spec() -> MethodSpec {
        MethodSpec::new("pkg.Svc", "Echo", RpcKind::Unary, IdempotencyLevel::Unknown)
    }

    fn capture_transport(seen: Arc<Mutex<Vec<String>>>) -> UnaryFn {
        Arc::new(move |req: RpcRequest| {
            let seen = seen.clone();
            Box::pin(async move {
                let mut names: Vec<String> =
                    req.headers.keys().map(|k| k.as_str().to_owned()).collect();
                names.sort();
                seen.lock().unwrap().extend(names);
                Ok(RpcResponse {
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                })
            })
        })
    }

    #[tokio::test]
    async fn header_interceptor_adds_header() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = {
            let mut chain = InterceptorChain::new();
            chain.push(Arc::new(HeaderInterceptor::new("x-auth", "token").unwrap()));
            chain
        };
        let wrapped = chain.wrap_unary(capture_transport(seen.clone()));
        wrapped(RpcRequest {
            spec: spec(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
        .await
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["x-auth"]);
    }

    #[tokio::test]
    async fn fn_interceptor_sees_request_and_response() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_in_fn = order.clone();
        let interceptor = FnInterceptor::unary(move |req, next| {
            let order = order_in_fn.clone();
            Box::pin(async move {
                order.lock().unwrap().push("before");
                let result = next.call(req).await;
                order.lock().unwrap().push("after");
                result
            })
        });

        let order_in_transport = order.clone();
        let transport: UnaryFn = Arc::new(move |_req| {
            let order = order_in_transport.clone();
            Box::pin(async move {
                order.lock().unwrap().push("transport");
                Ok(RpcResponse {
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                })
            })
        });

        let mut chain = InterceptorChain::new();
        chain.push(Arc::new(interceptor));
        let wrapped = chain.wrap_unary(transport);
        wrapped(RpcRequest {
            spec: spec(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
        .await
        .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["before", "transport", "after"]);
    }

    #[test]
    fn stream_headers_apply_in_order() {
        let mut chain = InterceptorChain::new();
        chain.push(Arc::new(HeaderInterceptor::new("x-first", "1").unwrap()));
        chain.push(Arc::new(HeaderInterceptor::new("x-second", "2").unwrap()));

        let mut headers = HeaderMap::new();
        chain.apply_stream_headers(&spec(), &mut headers);
        assert_eq!(headers.get("x-first").unwrap(), "1");
        assert_eq!(headers.get("x-second").unwrap(), "2");
    }
}

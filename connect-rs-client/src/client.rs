//! The async Connect client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use connect_rs_core::{
    Code, CompressionConfig, CompressionEncoding, ConnectError, MethodSpec, PROTOCOL_VERSION,
    PROTOCOL_VERSION_HEADER, RpcContentType, STREAM_ACCEPT_ENCODING_HEADER, STREAM_ENCODING_HEADER,
    TIMEOUT_HEADER, WireError, decode_message, decompress, encode_message, maybe_compress,
    supported_encodings, wrap_end_stream, wrap_envelope,
};
use futures::{Stream, StreamExt};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::builder::ConnectClientBuilder;
use crate::error::ClientError;
use crate::interceptor::{InterceptorChain, RpcRequest, RpcResponse, UnaryFn};
use crate::options::CallOptions;
use crate::streaming::{Streaming, Trailers, decode_single};

/// A successful non-streaming result: the decoded message plus response
/// headers and trailing metadata.
#[derive(Debug)]
pub struct CallResponse<T> {
    message: T,
    headers: HeaderMap,
    trailers: Trailers,
}

impl<T> CallResponse<T> {
    pub fn into_inner(self) -> T {
        self.message
    }

    pub fn get_ref(&self) -> &T {
        &self.message
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn trailers(&self) -> &Trailers {
        &self.trailers
    }
}

pub(crate) struct ClientInner {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) encoding: RpcContentType,
    pub(crate) send_compression: Option<CompressionEncoding>,
    pub(crate) compression: CompressionConfig,
    pub(crate) default_timeout: Option<Duration>,
    pub(crate) interceptors: InterceptorChain,
}

/// Connect protocol client.
///
/// Cheap to clone; connection pooling and retries belong to the underlying
/// HTTP client.
#[derive(Clone)]
pub struct ConnectClient {
    inner: Arc<ClientInner>,
}

impl ConnectClient {
    pub fn builder(base_url: impl Into<String>) -> ConnectClientBuilder {
        ConnectClientBuilder::new(base_url)
    }

    pub(crate) fn from_inner(inner: ClientInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    fn url_for(&self, spec: &MethodSpec) -> String {
        format!("{}{}", self.inner.base_url, spec.path())
    }

    /// Issue a unary call.
    ///
    /// When `options.use_get(true)` is set and the method is marked
    /// `no_side_effects`, the call goes out as an HTTP GET with the message
    /// in the query string; otherwise as a POST.
    pub async fn call_unary<Req, Resp>(
        &self,
        spec: MethodSpec,
        request: &Req,
        options: CallOptions,
    ) -> Result<CallResponse<Resp>, ClientError>
    where
        Req: Message + Serialize,
        Resp: Message + DeserializeOwned + Default,
    {
        let inner = self.inner.clone();
        let timeout = options.timeout_value().or(inner.default_timeout);
        let use_get = options.get_requested() && spec.allows_get();
        let url = self.url_for(&spec);

        let body = encode_message(inner.encoding, request).map_err(ClientError::Rpc)?;
        let headers = self.unary_headers(&options, timeout, use_get);

        let transport = self.unary_transport(url, use_get, timeout);
        let wrapped = inner.interceptors.wrap_unary(transport);
        let response = wrapped(RpcRequest {
            spec,
            headers,
            body: Bytes::from(body),
        })
        .await?;

        // The response content type echoes the request's subtype; trust it
        // when present so a JSON error from a proto call still decodes.
        let response_protocol = response
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(RpcContentType::from_content_type)
            .filter(RpcContentType::is_valid)
            .unwrap_or(inner.encoding);

        let message =
            decode_message(response_protocol, &response.body).map_err(ClientError::Rpc)?;
        let (headers, trailers) = split_unary_trailers(response.headers);
        Ok(CallResponse {
            message,
            headers,
            trailers,
        })
    }

    /// Issue a server-streaming call: one request message, a stream of
    /// responses.
    pub async fn call_server_stream<Req, Resp>(
        &self,
        spec: MethodSpec,
        request: &Req,
        options: CallOptions,
    ) -> Result<Streaming<Resp>, ClientError>
    where
        Req: Message + Serialize,
        Resp: Message + DeserializeOwned + Default + Send + 'static,
    {
        let inner = self.inner.clone();
        let protocol = inner.encoding.streaming_variant();
        let timeout = options.timeout_value().or(inner.default_timeout);
        let send_encoding = inner.send_compression.unwrap_or_default();

        let payload = encode_message(protocol, request).map_err(ClientError::Rpc)?;
        let (payload, compressed) = maybe_compress(payload, send_encoding, &inner.compression);
        let mut body = wrap_envelope(&payload, compressed);
        body.extend_from_slice(&wrap_end_stream(b"{}"));

        let headers = self.stream_headers(&spec, &options, timeout);
        let response = self
            .send_stream_request(spec, body.into(), headers, timeout)
            .await?;
        self.open_streaming_response(protocol, response).await
    }

    /// Issue a client-streaming call: a stream of requests, one response.
    pub async fn call_client_stream<Req, Resp, S>(
        &self,
        spec: MethodSpec,
        requests: S,
        options: CallOptions,
    ) -> Result<CallResponse<Resp>, ClientError>
    where
        Req: Message + Serialize + Send + 'static,
        Resp: Message + DeserializeOwned + Default,
        S: Stream<Item = Req> + Send + 'static,
    {
        let inner = self.inner.clone();
        let protocol = inner.encoding.streaming_variant();
        let timeout = options.timeout_value().or(inner.default_timeout);

        let headers = self.stream_headers(&spec, &options, timeout);
        let body = reqwest::Body::wrap_stream(frame_requests(
            requests,
            protocol,
            inner.send_compression.unwrap_or_default(),
            inner.compression,
        ));
        let response = self
            .send_stream_request(spec, body, headers, timeout)
            .await?;

        let status = response.status();
        let response_headers = response.headers().clone();
        if status != StatusCode::OK {
            let body = response.bytes().await.unwrap_or_default();
            return Err(parse_unary_error(status, &response_headers, &body));
        }
        let encoding = stream_response_encoding(&response_headers)?;
        let bytes = response.bytes().await?;
        let (message, trailers) = decode_single::<Resp>(&bytes, protocol, encoding)?;
        Ok(CallResponse {
            message,
            headers: response_headers,
            trailers,
        })
    }

    /// Issue a bidirectional-streaming call. Full duplex requires HTTP/2 end
    /// to end; over HTTP/1.1 the exchange degrades to half duplex.
    pub async fn call_bidi_stream<Req, Resp, S>(
        &self,
        spec: MethodSpec,
        requests: S,
        options: CallOptions,
    ) -> Result<Streaming<Resp>, ClientError>
    where
        Req: Message + Serialize + Send + 'static,
        Resp: Message + DeserializeOwned + Default + Send + 'static,
        S: Stream<Item = Req> + Send + 'static,
    {
        let inner = self.inner.clone();
        let protocol = inner.encoding.streaming_variant();
        let timeout = options.timeout_value().or(inner.default_timeout);

        let headers = self.stream_headers(&spec, &options, timeout);
        let body = reqwest::Body::wrap_stream(frame_requests(
            requests,
            protocol,
            inner.send_compression.unwrap_or_default(),
            inner.compression,
        ));
        let response = self
            .send_stream_request(spec, body, headers, timeout)
            .await?;
        self.open_streaming_response(protocol, response).await
    }

    /// Protocol default headers for a unary call, merged with the caller's.
    fn unary_headers(
        &self,
        options: &CallOptions,
        timeout: Option<Duration>,
        use_get: bool,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if !use_get {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(self.inner.encoding.response_content_type()),
            );
        }
        headers.insert(
            PROTOCOL_VERSION_HEADER,
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static(supported_encodings()),
        );
        insert_timeout(&mut headers, timeout);
        headers.extend(options.headers().clone());
        headers
    }

    /// Protocol default headers for a streaming call, merged with the
    /// caller's and rewritten by the interceptors' stream hook.
    fn stream_headers(
        &self,
        spec: &MethodSpec,
        options: &CallOptions,
        timeout: Option<Duration>,
    ) -> HeaderMap {
        let protocol = self.inner.encoding.streaming_variant();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(protocol.response_content_type()),
        );
        headers.insert(
            PROTOCOL_VERSION_HEADER,
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        headers.insert(
            STREAM_ACCEPT_ENCODING_HEADER,
            HeaderValue::from_static(supported_encodings()),
        );
        if let Some(encoding) = self.inner.send_compression
            && !encoding.is_identity()
        {
            headers.insert(
                STREAM_ENCODING_HEADER,
                HeaderValue::from_static(encoding.as_str()),
            );
        }
        insert_timeout(&mut headers, timeout);
        headers.extend(options.headers().clone());
        self.inner.interceptors.apply_stream_headers(spec, &mut headers);
        headers
    }

    /// The terminal transport for unary calls: compression, HTTP I/O, error
    /// parsing, response decompression.
    fn unary_transport(&self, url: String, use_get: bool, timeout: Option<Duration>) -> UnaryFn {
        let inner = self.inner.clone();
        Arc::new(move |request: RpcRequest| {
            let inner = inner.clone();
            let url = url.clone();
            Box::pin(async move {
                let mut builder = if use_get {
                    inner.http.get(get_url(
                        &url,
                        inner.encoding,
                        &request.body,
                        inner.send_compression.unwrap_or_default(),
                        &inner.compression,
                    ))
                } else {
                    let (body, compressed) = maybe_compress(
                        request.body.to_vec(),
                        inner.send_compression.unwrap_or_default(),
                        &inner.compression,
                    );
                    let mut builder = inner.http.post(&url).body(body);
                    if compressed
                        && let Some(encoding) = inner.send_compression
                    {
                        builder = builder.header(
                            header::CONTENT_ENCODING,
                            HeaderValue::from_static(encoding.as_str()),
                        );
                    }
                    builder
                };
                builder = builder.headers(request.headers);
                if let Some(timeout) = timeout {
                    builder = builder.timeout(timeout);
                }

                let response = builder.send().await?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = response.bytes().await?;

                if status != StatusCode::OK {
                    return Err(parse_unary_error(status, &headers, &body));
                }

                let encoding = unary_response_encoding(&headers)?;
                let body = decompress(body, encoding).map_err(ClientError::Rpc)?;
                Ok(RpcResponse { headers, body })
            })
        })
    }

    async fn send_stream_request(
        &self,
        spec: MethodSpec,
        body: reqwest::Body,
        headers: HeaderMap,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut builder = self
            .inner
            .http
            .post(self.url_for(&spec))
            .headers(headers)
            .body(body);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder.send().await?)
    }

    async fn open_streaming_response<Resp>(
        &self,
        protocol: RpcContentType,
        response: reqwest::Response,
    ) -> Result<Streaming<Resp>, ClientError>
    where
        Resp: Message + DeserializeOwned + Default + Send + 'static,
    {
        let status = response.status();
        if status != StatusCode::OK {
            let headers = response.headers().clone();
            let body = response.bytes().await.unwrap_or_default();
            return Err(parse_unary_error(status, &headers, &body));
        }
        let encoding = stream_response_encoding(response.headers())?;
        Ok(Streaming::from_body(
            response.bytes_stream(),
            protocol,
            encoding,
        ))
    }
}

fn insert_timeout(headers: &mut HeaderMap, timeout: Option<Duration>) {
    if let Some(timeout) = timeout
        && let Ok(value) = HeaderValue::from_str(&timeout.as_millis().to_string())
    {
        headers.insert(TIMEOUT_HEADER, value);
    }
}

/// Build the GET request URL: `?connect=v1&encoding=...&message=...` with the
/// message as unpadded base64url, compressed first when configured.
fn get_url(
    url: &str,
    encoding: RpcContentType,
    body: &Bytes,
    send_encoding: CompressionEncoding,
    compression: &CompressionConfig,
) -> String {
    let codec = if encoding.is_proto() { "proto" } else { "json" };
    let (bytes, compressed) = maybe_compress(body.to_vec(), send_encoding, compression);
    let message = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    if compressed {
        format!(
            "{url}?connect=v1&encoding={codec}&message={message}&compression={}",
            send_encoding.as_str()
        )
    } else {
        format!("{url}?connect=v1&encoding={codec}&message={message}")
    }
}

/// Decode a non-200 unary response into a structured error, falling back to
/// the status-code table when the body is not a Connect error.
fn parse_unary_error(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ClientError {
    let fallback = Code::from_http_status(status);

    let mut err = match serde_json::from_slice::<WireError>(body) {
        Ok(wire) if !wire.is_empty() => wire.into_error(fallback),
        _ => {
            let message = std::str::from_utf8(body)
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error"));
            ConnectError::new(fallback, message)
        }
    };
    for (name, value) in headers {
        err.meta_mut().append(name.clone(), value.clone());
    }
    ClientError::Rpc(err)
}

fn unary_response_encoding(headers: &HeaderMap) -> Result<CompressionEncoding, ClientError> {
    response_encoding(headers.get(header::CONTENT_ENCODING))
}

fn stream_response_encoding(headers: &HeaderMap) -> Result<CompressionEncoding, ClientError> {
    response_encoding(headers.get(STREAM_ENCODING_HEADER))
}

fn response_encoding(value: Option<&HeaderValue>) -> Result<CompressionEncoding, ClientError> {
    let value = value.and_then(|v| v.to_str().ok());
    CompressionEncoding::from_header(value).ok_or_else(|| {
        ClientError::Protocol(format!(
            "server responded with unsupported encoding \"{}\"",
            value.unwrap_or("")
        ))
    })
}

/// Split `Trailer-`-prefixed headers out of a unary response header map.
fn split_unary_trailers(headers: HeaderMap) -> (HeaderMap, Trailers) {
    let mut plain = HeaderMap::new();
    let mut trailers: Trailers = BTreeMap::new();
    for (name, value) in &headers {
        let name_str = name.as_str();
        if let Some(stripped) = name_str.strip_prefix("trailer-") {
            if let Ok(text) = value.to_str() {
                trailers
                    .entry(stripped.to_string())
                    .or_default()
                    .push(text.to_string());
            }
        } else {
            plain.append(name.clone(), value.clone());
        }
    }
    (plain, trailers)
}

/// Encode and frame an outbound request stream, terminated by an
/// end-of-stream envelope.
fn frame_requests<Req, S>(
    requests: S,
    protocol: RpcContentType,
    send_encoding: CompressionEncoding,
    compression: CompressionConfig,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    Req: Message + Serialize + Send + 'static,
    S: Stream<Item = Req> + Send + 'static,
{
    async_stream::stream! {
        let mut requests = std::pin::pin!(requests);
        while let Some(message) = requests.next().await {
            match encode_message(protocol, &message) {
                Ok(payload) => {
                    let (payload, compressed) =
                        maybe_compress(payload, send_encoding, &compression);
                    yield Ok(Bytes::from(wrap_envelope(&payload, compressed)));
                }
                Err(err) => {
                    // Ending the body without an end-of-stream envelope tells
                    // the server the stream was aborted.
                    tracing::debug!(error = %err, "failed to encode outbound message");
                    yield Err(std::io::Error::other(err.to_string()));
                    return;
                }
            }
        }
        yield Ok(Bytes::from(wrap_end_stream(b"{}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_url_uses_unpadded_base64url() {
        let url = get_url(
            "http://host/pkg.Svc/Get",
            RpcContentType::UnaryProto,
            &Bytes::from_static(&[0x08, 0x07]),
            CompressionEncoding::Identity,
            &CompressionConfig::default(),
        );
        assert_eq!(url, "http://host/pkg.Svc/Get?connect=v1&encoding=proto&message=CAc");
    }

    #[test]
    fn get_url_names_compression_when_applied() {
        let body = Bytes::from(vec![0u8; 2048]);
        let url = get_url(
            "http://host/pkg.Svc/Get",
            RpcContentType::UnaryProto,
            &body,
            CompressionEncoding::Gzip,
            &CompressionConfig::default(),
        );
        assert!(url.contains("&compression=gzip"));
    }

    #[test]
    fn error_parse_prefers_structured_body() {
        let body = br#"{"code":"not_found","message":"gone"}"#;
        let err = parse_unary_error(StatusCode::NOT_FOUND, &HeaderMap::new(), body);
        let rpc = err.as_rpc().unwrap();
        assert_eq!(rpc.code(), Code::NotFound);
        assert_eq!(rpc.message(), Some("gone"));
    }

    #[test]
    fn error_parse_falls_back_to_status_table() {
        let err = parse_unary_error(StatusCode::SERVICE_UNAVAILABLE, &HeaderMap::new(), b"");
        assert_eq!(err.code(), Code::Unavailable);

        let err = parse_unary_error(StatusCode::IM_A_TEAPOT, &HeaderMap::new(), b"oops");
        assert_eq!(err.code(), Code::Unknown);
        assert_eq!(err.as_rpc().unwrap().message(), Some("oops"));
    }

    #[test]
    fn error_parse_attaches_header_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert("x-reason", HeaderValue::from_static("quota"));
        let err = parse_unary_error(StatusCode::TOO_MANY_REQUESTS, &headers, b"{}");
        assert_eq!(err.as_rpc().unwrap().meta().get("x-reason").unwrap(), "quota");
    }

    #[test]
    fn trailer_prefixed_headers_split_out() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/proto"));
        headers.insert("trailer-checksum", HeaderValue::from_static("abc"));
        let (plain, trailers) = split_unary_trailers(headers);
        assert!(plain.contains_key("content-type"));
        assert!(!plain.contains_key("trailer-checksum"));
        assert_eq!(trailers.get("checksum").unwrap(), &vec!["abc".to_string()]);
    }

    #[test]
    fn response_encoding_rejects_unknown() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("lz4"));
        assert!(unary_response_encoding(&headers).is_err());
        headers.remove(header::CONTENT_ENCODING);
        assert_eq!(
            unary_response_encoding(&headers).unwrap(),
            CompressionEncoding::Identity
        );
    }
}

//! Client construction.

use std::sync::Arc;
use std::time::Duration;

use connect_rs_core::{CompressionConfig, CompressionEncoding, RpcContentType};

use crate::client::{ClientInner, ConnectClient};
use crate::error::ClientError;
use crate::interceptor::{Interceptor, InterceptorChain};

/// Builder for [`ConnectClient`].
pub struct ConnectClientBuilder {
    base_url: String,
    encoding: RpcContentType,
    send_compression: Option<CompressionEncoding>,
    compression: CompressionConfig,
    default_timeout: Option<Duration>,
    interceptors: InterceptorChain,
    http: Option<reqwest::Client>,
}

impl ConnectClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            encoding: RpcContentType::UnaryProto,
            send_compression: None,
            compression: CompressionConfig::default(),
            default_timeout: None,
            interceptors: InterceptorChain::new(),
            http: None,
        }
    }

    /// Encode request messages as binary protobuf (the default).
    pub fn use_proto(mut self) -> Self {
        self.encoding = RpcContentType::UnaryProto;
        self
    }

    /// Encode request messages as canonical protobuf JSON.
    pub fn use_json(mut self) -> Self {
        self.encoding = RpcContentType::UnaryJson;
        self
    }

    /// Compress request bodies (and request frames on streams) with this
    /// encoding. The client never advertises an encoding it cannot
    /// decompress, so this must be one of the compiled-in codecs.
    pub fn send_compression(mut self, encoding: CompressionEncoding) -> Self {
        self.send_compression = Some(encoding);
        self
    }

    /// Threshold and level for request compression.
    pub fn compression_config(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    /// Deadline applied to every call without an explicit per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Append an interceptor. Interceptors run in the order they are added.
    pub fn with_interceptor<I: Interceptor + 'static>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Use a preconfigured reqwest client (connection pools, TLS, proxies).
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Result<ConnectClient, ClientError> {
        let base_url = self.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ClientError::Protocol("empty base URL".into()));
        }

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .build()
                .map_err(|e| ClientError::Transport(e.to_string()))?,
        };

        Ok(ConnectClient::from_inner(ClientInner {
            http,
            base_url,
            encoding: self.encoding,
            send_compression: self.send_compression,
            compression: self.compression,
            default_timeout: self.default_timeout,
            interceptors: self.interceptors,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_normalized() {
        let client = ConnectClientBuilder::new("http://localhost:3000/")
            .build()
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000");
    }

    #[test]
    fn empty_base_url_is_rejected() {
        assert!(ConnectClientBuilder::new("").build().is_err());
    }
}

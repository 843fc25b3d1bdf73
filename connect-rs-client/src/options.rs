//! Per-call options.

use std::time::Duration;

use connect_rs_core::encode_binary_value;
use http::{HeaderMap, HeaderName, HeaderValue};

/// Options applied to a single call: extra headers, a deadline, and the GET
/// opt-in for side-effect-free unary methods.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    headers: HeaderMap,
    timeout: Option<Duration>,
    use_get: bool,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header. Invalid names or values are dropped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => {
                tracing::debug!(name, "invalid call header, dropped");
            }
        }
        self
    }

    /// Append binary metadata; the name must end in `-Bin` and the value is
    /// base64-encoded on the wire.
    pub fn binary_header(mut self, name: &str, value: &[u8]) -> Self {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            self.headers.append(name, encode_binary_value(value));
        }
        self
    }

    /// Deadline for this call, sent as `Connect-Timeout-Ms` and enforced
    /// locally.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Issue this unary call as an HTTP GET. Ignored unless the method is
    /// marked `no_side_effects`.
    pub fn use_get(mut self, use_get: bool) -> Self {
        self.use_get = use_get;
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn get_requested(&self) -> bool {
        self.use_get
    }
}

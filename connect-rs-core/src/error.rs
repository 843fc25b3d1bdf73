//! Connect protocol error codes and the structured error type.
//!
//! Every failure that crosses the wire is a [`ConnectError`]: a [`Code`], an
//! optional message, optional self-describing details, and side-channel
//! metadata. The JSON wire shape and the HTTP status mapping live here so the
//! server and client crates agree on both directions.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// Standard base64 decoder that accepts both padded and unpadded input.
///
/// Detail values are emitted with padding, but peers in the wild send both.
const STANDARD_INDIFFERENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Connect RPC error codes, matching the closed set defined by the protocol.
///
/// There is deliberately no `Ok` variant: a successful RPC produces no error
/// value at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    /// The canonical lowercase wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    /// Parse a code from its wire string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "canceled" | "cancelled" => Some(Code::Canceled),
            "unknown" => Some(Code::Unknown),
            "invalid_argument" => Some(Code::InvalidArgument),
            "deadline_exceeded" => Some(Code::DeadlineExceeded),
            "not_found" => Some(Code::NotFound),
            "already_exists" => Some(Code::AlreadyExists),
            "permission_denied" => Some(Code::PermissionDenied),
            "resource_exhausted" => Some(Code::ResourceExhausted),
            "failed_precondition" => Some(Code::FailedPrecondition),
            "aborted" => Some(Code::Aborted),
            "out_of_range" => Some(Code::OutOfRange),
            "unimplemented" => Some(Code::Unimplemented),
            "internal" => Some(Code::Internal),
            "unavailable" => Some(Code::Unavailable),
            "data_loss" => Some(Code::DataLoss),
            "unauthenticated" => Some(Code::Unauthenticated),
            _ => None,
        }
    }

    /// HTTP status used for unary error responses.
    ///
    /// Streaming responses never use this: they are always HTTP 200 with the
    /// error carried in the end-of-stream envelope.
    pub fn http_status(&self) -> StatusCode {
        match self {
            // 499 Client Closed Request (nginx extension)
            Code::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::AlreadyExists => StatusCode::CONFLICT,
            Code::PermissionDenied => StatusCode::FORBIDDEN,
            Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            Code::Aborted => StatusCode::CONFLICT,
            Code::OutOfRange => StatusCode::BAD_REQUEST,
            Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
            Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        }
    }

    /// Derive a code from an HTTP status, for unary error responses without a
    /// parseable body. Statuses outside the table map to [`Code::Unknown`].
    pub fn from_http_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 => Code::InvalidArgument,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::NotFound,
            409 => Code::AlreadyExists,
            412 => Code::FailedPrecondition,
            429 => Code::ResourceExhausted,
            499 => Code::Canceled,
            500 => Code::Internal,
            501 => Code::Unimplemented,
            502 | 503 => Code::Unavailable,
            504 => Code::DeadlineExceeded,
            _ => Code::Unknown,
        }
    }

    /// Whether this code indicates a transient condition that may be resolved
    /// by retrying: `unavailable` and `deadline_exceeded`, the transport
    /// retry default. Retry execution itself belongs to the HTTP client; this
    /// is only the classification.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Code::Unavailable | Code::DeadlineExceeded)
    }
}

impl Serialize for Code {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A self-describing error detail, mapping to `google.protobuf.Any` on the
/// wire.
///
/// Serialized as `{"type": "<short name>", "value": "<base64>"}`; the
/// `type.googleapis.com/` prefix is stripped on emission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorDetail {
    type_url: String,
    value: Vec<u8>,
}

impl ErrorDetail {
    pub fn new<S: Into<String>>(type_url: S, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }

    /// Fully-qualified type name (e.g. `google.rpc.RetryInfo`).
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// Protobuf-encoded message bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

impl Serialize for ErrorDetail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ErrorDetail", 2)?;
        let type_name = self
            .type_url
            .strip_prefix("type.googleapis.com/")
            .unwrap_or(&self.type_url);
        s.serialize_field("type", type_name)?;
        s.serialize_field(
            "value",
            &base64::engine::general_purpose::STANDARD.encode(&self.value),
        )?;
        s.end()
    }
}

/// The structured error passed between handlers and the wire.
///
/// Identity is `(code, message, details)`; metadata is a side channel and is
/// excluded from equality.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{}", display_message(.code, .message))]
pub struct ConnectError {
    code: Code,
    message: Option<String>,
    details: Vec<ErrorDetail>,
    meta: HeaderMap,
}

fn display_message(code: &Code, message: &Option<String>) -> String {
    match message {
        Some(msg) => format!("{code}: {msg}"),
        None => code.as_str().to_string(),
    }
}

impl PartialEq for ConnectError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message && self.details == other.details
    }
}

impl ConnectError {
    /// Create a new error with a code and message.
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            code,
            message: Some(message.into()),
            details: vec![],
            meta: HeaderMap::new(),
        }
    }

    /// Create a new error with just a code.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
            details: vec![],
            meta: HeaderMap::new(),
        }
    }

    pub fn canceled<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Canceled, message)
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded<S: Into<String>>(message: S) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn already_exists<S: Into<String>>(message: S) -> Self {
        Self::new(Code::AlreadyExists, message)
    }

    pub fn permission_denied<S: Into<String>>(message: S) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn resource_exhausted<S: Into<String>>(message: S) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn failed_precondition<S: Into<String>>(message: S) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn aborted<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Aborted, message)
    }

    pub fn unimplemented<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn unauthenticated<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn details(&self) -> &[ErrorDetail] {
        &self.details
    }

    /// Add an error detail with type URL and protobuf-encoded bytes.
    pub fn add_detail<S: Into<String>>(mut self, type_url: S, value: Vec<u8>) -> Self {
        self.details.push(ErrorDetail::new(type_url, value));
        self
    }

    /// Add a pre-constructed detail.
    pub fn add_error_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    /// Side-channel metadata attached to this error.
    pub fn meta(&self) -> &HeaderMap {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut HeaderMap {
        &mut self.meta
    }

    /// Append a metadata header. Invalid names or values are dropped.
    pub fn with_meta<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        match (
            HeaderName::from_bytes(key.as_ref().as_bytes()),
            HeaderValue::from_str(value.as_ref()),
        ) {
            (Ok(name), Ok(val)) => {
                self.meta.append(name, val);
            }
            _ => {
                tracing::debug!(key = key.as_ref(), "invalid error metadata, dropped");
            }
        }
        self
    }
}

// Serializes to the unary error response body: {"code","message"?,"details"?}.
impl Serialize for ConnectError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut fields = 1;
        if self.message.is_some() {
            fields += 1;
        }
        if !self.details.is_empty() {
            fields += 1;
        }
        let mut s = serializer.serialize_struct("ConnectError", fields)?;
        s.serialize_field("code", &self.code)?;
        if let Some(msg) = &self.message {
            s.serialize_field("message", msg)?;
        }
        if !self.details.is_empty() {
            s.serialize_field("details", &self.details)?;
        }
        s.end()
    }
}

/// Serialize the unary error response body.
///
/// Falls back to a hardcoded internal error body that cannot fail.
pub fn error_json_bytes(err: &ConnectError) -> Vec<u8> {
    serde_json::to_vec(err).unwrap_or_else(|_| {
        br#"{"code":"internal","message":"error serialization failed"}"#.to_vec()
    })
}

/// Serialize the end-of-stream envelope payload.
///
/// An empty object `{}` signals success; otherwise the error fields appear at
/// the top level, with error metadata and handler trailers merged into the
/// `metadata` map.
pub fn end_stream_json(error: Option<&ConnectError>, trailers: Option<&HeaderMap>) -> Vec<u8> {
    let mut root = serde_json::Map::new();
    let mut metadata = serde_json::Map::new();

    if let Some(err) = error {
        root.insert("code".into(), serde_json::Value::String(err.code.as_str().into()));
        if let Some(msg) = err.message() {
            root.insert("message".into(), serde_json::Value::String(msg.into()));
        }
        if !err.details.is_empty() {
            if let Ok(details) = serde_json::to_value(&err.details) {
                root.insert("details".into(), details);
            }
        }
        merge_metadata(&mut metadata, &err.meta);
    }
    if let Some(trailers) = trailers {
        merge_metadata(&mut metadata, trailers);
    }
    if !metadata.is_empty() {
        root.insert("metadata".into(), serde_json::Value::Object(metadata));
    }

    serde_json::to_vec(&serde_json::Value::Object(root)).unwrap_or_else(|_| b"{}".to_vec())
}

fn merge_metadata(out: &mut serde_json::Map<String, serde_json::Value>, headers: &HeaderMap) {
    for name in headers.keys() {
        let values: Vec<serde_json::Value> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| serde_json::Value::String(v.to_string()))
            .collect();
        if !values.is_empty() {
            out.insert(name.as_str().to_string(), serde_json::Value::Array(values));
        }
    }
}

/// Wire shape of an error body or end-of-stream payload, for decoding at the
/// client.
#[derive(Debug, Default, Deserialize)]
pub struct WireError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Vec<WireErrorDetail>,
    #[serde(default)]
    pub metadata: Option<std::collections::BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize)]
pub struct WireErrorDetail {
    #[serde(rename = "type")]
    pub type_url: String,
    #[serde(default)]
    pub value: String,
    // Servers may include a "debug" rendering of the detail; it is advisory
    // and ignored on decode.
    #[serde(default)]
    pub debug: Option<serde_json::Value>,
}

impl WireError {
    /// Whether this payload carries an error at all. `{}` decodes to an empty
    /// `WireError` and means successful completion.
    pub fn is_empty(&self) -> bool {
        self.code.is_none()
            && self.message.is_none()
            && self.details.is_empty()
            && self.metadata.is_none()
    }

    /// Build a [`ConnectError`], falling back to `fallback` when the code
    /// string is missing or unrecognized.
    pub fn into_error(self, fallback: Code) -> ConnectError {
        let code = self
            .code
            .as_deref()
            .and_then(Code::from_str)
            .unwrap_or(fallback);
        let mut err = match self.message {
            Some(message) => ConnectError::new(code, message),
            None => ConnectError::from_code(code),
        };
        for detail in self.details {
            if let Ok(value) = STANDARD_INDIFFERENT.decode(&detail.value) {
                err = err.add_error_detail(ErrorDetail::new(detail.type_url, value));
            }
        }
        if let Some(metadata) = self.metadata {
            for (name, values) in metadata {
                for value in values {
                    err = err.with_meta(&name, &value);
                }
            }
        }
        err
    }
}

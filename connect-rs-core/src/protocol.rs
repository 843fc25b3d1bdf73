//! Content-type negotiation and message codec selection.
//!
//! The Connect protocol identifies the message codec and the call family
//! (unary vs streaming) through the request Content-Type. Subtypes are
//! matched case-insensitively against the part after `application/`.

use crate::error::{Code, ConnectError};
use prost::Message;
use serde::{Serialize, de::DeserializeOwned};

/// The Connect protocol version carried in `Connect-Protocol-Version` and the
/// GET `connect` query parameter (without the leading `v`).
pub const PROTOCOL_VERSION: &str = "1";

/// Header name for the protocol version.
pub const PROTOCOL_VERSION_HEADER: &str = "connect-protocol-version";

/// Header name for the request timeout in milliseconds.
pub const TIMEOUT_HEADER: &str = "connect-timeout-ms";

/// Header carrying per-frame compression of a streaming request or response.
pub const STREAM_ENCODING_HEADER: &str = "connect-content-encoding";

/// Header advertising acceptable per-frame compressions for streams.
pub const STREAM_ACCEPT_ENCODING_HEADER: &str = "connect-accept-encoding";

/// Protocol variant identified from the request Content-Type (or the GET
/// `encoding` query parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RpcContentType {
    /// `application/json`: unary, canonical protobuf JSON.
    #[default]
    UnaryJson,
    /// `application/proto`: unary, binary protobuf.
    UnaryProto,
    /// `application/connect+json`: envelope-framed, JSON messages.
    StreamJson,
    /// `application/connect+proto`: envelope-framed, binary messages.
    StreamProto,
    /// Anything else. Requests with this variant are rejected.
    Unknown,
}

impl RpcContentType {
    /// Identify the protocol variant from a Content-Type header value.
    ///
    /// Parameters (`; charset=utf-8`) are ignored and the subtype comparison
    /// is case-insensitive.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let Some(subtype) = essence.strip_prefix("application/") else {
            return Self::Unknown;
        };
        match subtype {
            "proto" => Self::UnaryProto,
            "json" => Self::UnaryJson,
            "connect+proto" => Self::StreamProto,
            "connect+json" => Self::StreamJson,
            _ => Self::Unknown,
        }
    }

    /// Identify the unary variant from a GET `encoding` query parameter.
    pub fn from_get_encoding(encoding: &str) -> Self {
        match encoding.to_ascii_lowercase().as_str() {
            "proto" => Self::UnaryProto,
            "json" => Self::UnaryJson,
            _ => Self::Unknown,
        }
    }

    /// Content-Type for successful responses; echoes the request's subtype.
    pub fn response_content_type(&self) -> &'static str {
        match self {
            Self::UnaryJson | Self::Unknown => "application/json",
            Self::UnaryProto => "application/proto",
            Self::StreamJson => "application/connect+json",
            Self::StreamProto => "application/connect+proto",
        }
    }

    /// Content-Type for error responses. Unary errors are always JSON;
    /// streaming errors ride the end-of-stream envelope of the negotiated
    /// stream content type.
    pub fn error_content_type(&self) -> &'static str {
        match self {
            Self::UnaryJson | Self::UnaryProto | Self::Unknown => "application/json",
            Self::StreamJson => "application/connect+json",
            Self::StreamProto => "application/connect+proto",
        }
    }

    /// Whether message bodies are binary protobuf (vs canonical JSON).
    pub fn is_proto(&self) -> bool {
        matches!(self, Self::UnaryProto | Self::StreamProto)
    }

    /// Whether bodies are sequences of 5-byte-prefixed envelopes.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::StreamJson | Self::StreamProto)
    }

    pub fn is_unary(&self) -> bool {
        matches!(self, Self::UnaryJson | Self::UnaryProto)
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// The streaming content type with the same message codec. Used when a
    /// unary-shaped request (client streaming input, GET) produces a framed
    /// response.
    pub fn streaming_variant(&self) -> Self {
        if self.is_proto() {
            Self::StreamProto
        } else {
            Self::StreamJson
        }
    }
}

/// Decode a binary protobuf message.
pub fn decode_proto<T: Message + Default>(bytes: &[u8]) -> Result<T, ConnectError> {
    T::decode(bytes)
        .map_err(|e| ConnectError::new(Code::InvalidArgument, format!("decode protobuf: {e}")))
}

/// Decode a canonical-JSON message.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ConnectError> {
    serde_json::from_slice(bytes)
        .map_err(|e| ConnectError::new(Code::InvalidArgument, format!("decode JSON: {e}")))
}

/// Decode a message with the codec selected by `content_type`.
pub fn decode_message<T>(content_type: RpcContentType, bytes: &[u8]) -> Result<T, ConnectError>
where
    T: Message + DeserializeOwned + Default,
{
    if content_type.is_proto() {
        decode_proto(bytes)
    } else {
        decode_json(bytes)
    }
}

/// Encode a binary protobuf message.
pub fn encode_proto<T: Message>(message: &T) -> Vec<u8> {
    message.encode_to_vec()
}

/// Encode a canonical-JSON message.
pub fn encode_json<T: Serialize>(message: &T) -> Result<Vec<u8>, ConnectError> {
    serde_json::to_vec(message)
        .map_err(|e| ConnectError::new(Code::Internal, format!("encode JSON: {e}")))
}

/// Encode a message with the codec selected by `content_type`.
pub fn encode_message<T>(content_type: RpcContentType, message: &T) -> Result<Vec<u8>, ConnectError>
where
    T: Message + Serialize,
{
    if content_type.is_proto() {
        Ok(encode_proto(message))
    } else {
        encode_json(message)
    }
}

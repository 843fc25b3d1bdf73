//! Decoding of streaming response bodies.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use connect_rs_core::{
    Code, CompressionEncoding, EnvelopeDecoder, RpcContentType, WireError, decode_message,
    open_frame,
};
use futures::{Stream, StreamExt};
use prost::Message;
use serde::de::DeserializeOwned;

use crate::error::ClientError;

/// Trailing metadata from the end-of-stream envelope, name to ordered values.
pub type Trailers = BTreeMap<String, Vec<String>>;

type SharedTrailers = Arc<Mutex<Option<Trailers>>>;

/// A stream of decoded response messages.
///
/// The end-of-stream envelope terminates iteration: an empty payload ends the
/// stream cleanly, an error payload is raised on the poll after the last good
/// message. [`trailers`](Self::trailers) is populated once the end-of-stream
/// envelope has been seen.
pub struct Streaming<T> {
    inner: Pin<Box<dyn Stream<Item = Result<T, ClientError>> + Send>>,
    trailers: SharedTrailers,
}

impl<T> Streaming<T>
where
    T: Message + DeserializeOwned + Default + Send + 'static,
{
    /// Decode a byte stream (an HTTP response body) into messages.
    pub(crate) fn from_body<B>(
        body: B,
        protocol: RpcContentType,
        encoding: CompressionEncoding,
    ) -> Self
    where
        B: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    {
        let trailers: SharedTrailers = Arc::new(Mutex::new(None));
        let trailers_slot = trailers.clone();

        let inner = async_stream::stream! {
            let mut body = std::pin::pin!(body);
            let mut decoder = EnvelopeDecoder::new(None);

            loop {
                loop {
                    let frame = match decoder.next_frame() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(err) => {
                            yield Err(ClientError::Rpc(err));
                            return;
                        }
                    };
                    if frame.is_end_stream() {
                        match finish_stream(&frame.payload, &trailers_slot) {
                            Ok(()) => {}
                            Err(err) => yield Err(err),
                        }
                        return;
                    }
                    let payload = match open_frame(frame, encoding) {
                        Ok(Some(payload)) => payload,
                        Ok(None) => return,
                        Err(err) => {
                            yield Err(ClientError::Rpc(err));
                            return;
                        }
                    };
                    match decode_message(protocol, &payload) {
                        Ok(message) => yield Ok(message),
                        Err(err) => {
                            yield Err(ClientError::Rpc(err));
                            return;
                        }
                    }
                }

                match body.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(err)) => {
                        yield Err(ClientError::Transport(err.to_string()));
                        return;
                    }
                    None => {
                        yield Err(ClientError::Protocol(
                            "response body ended without an end-of-stream envelope".into(),
                        ));
                        return;
                    }
                }
            }
        };

        Self {
            inner: Box::pin(inner),
            trailers,
        }
    }
}

impl<T> Streaming<T> {
    /// Trailing metadata, available after the end-of-stream envelope has been
    /// consumed.
    pub fn trailers(&self) -> Option<Trailers> {
        self.trailers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle the end-of-stream payload: record trailers, surface an error when
/// the payload carries one.
fn finish_stream(payload: &[u8], trailers: &SharedTrailers) -> Result<(), ClientError> {
    let wire: WireError = serde_json::from_slice(payload)
        .map_err(|e| ClientError::Protocol(format!("malformed end-of-stream payload: {e}")))?;

    let is_error = wire.code.is_some() || wire.message.is_some() || !wire.details.is_empty();
    let metadata = wire.metadata.clone().unwrap_or_default();
    *trailers.lock().unwrap_or_else(PoisonError::into_inner) = Some(metadata);

    if is_error {
        Err(ClientError::Rpc(wire.into_error(Code::Unknown)))
    } else {
        Ok(())
    }
}

/// Decode a complete streaming body that should hold exactly one message plus
/// the end-of-stream envelope (the response shape of client-streaming calls).
pub(crate) fn decode_single<T>(
    body: &[u8],
    protocol: RpcContentType,
    encoding: CompressionEncoding,
) -> Result<(T, Trailers), ClientError>
where
    T: Message + DeserializeOwned + Default,
{
    let mut decoder = EnvelopeDecoder::new(None);
    decoder.push(body);

    let mut message: Option<T> = None;
    let mut trailers = Trailers::new();
    while let Some(frame) = decoder.next_frame().map_err(ClientError::Rpc)? {
        if frame.is_end_stream() {
            let wire: WireError = serde_json::from_slice(&frame.payload).map_err(|e| {
                ClientError::Protocol(format!("malformed end-of-stream payload: {e}"))
            })?;
            let is_error =
                wire.code.is_some() || wire.message.is_some() || !wire.details.is_empty();
            trailers = wire.metadata.clone().unwrap_or_default();
            if is_error {
                return Err(ClientError::Rpc(wire.into_error(Code::Unknown)));
            }
            continue;
        }
        let payload = open_frame(frame, encoding)
            .map_err(ClientError::Rpc)?
            .unwrap_or_default();
        if message.is_some() {
            return Err(ClientError::Protocol(
                "expected a single response message".into(),
            ));
        }
        message = Some(decode_message(protocol, &payload).map_err(ClientError::Rpc)?);
    }
    decoder.finish().map_err(ClientError::Rpc)?;
    if !decoder.saw_end_stream() {
        return Err(ClientError::Protocol(
            "response body ended without an end-of-stream envelope".into(),
        ));
    }

    match message {
        Some(message) => Ok((message, trailers)),
        None => Err(ClientError::Protocol("missing response message".into())),
    }
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> std::fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streaming").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_rs_core::{ConnectError, end_stream_json, wrap_end_stream, wrap_envelope};

    #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
    struct Item {
        #[prost(string, tag = "1")]
        name: String,
    }

    fn body_stream(bytes: Vec<u8>) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send {
        futures::stream::iter(vec![Ok(Bytes::from(bytes))])
    }

    #[tokio::test]
    async fn yields_messages_then_ends_on_empty_end_stream() {
        let mut body = Vec::new();
        for name in ["a", "b"] {
            body.extend_from_slice(&wrap_envelope(
                &Item { name: name.into() }.encode_to_vec(),
                false,
            ));
        }
        body.extend_from_slice(&wrap_end_stream(b"{}"));

        let mut stream = Streaming::<Item>::from_body(
            body_stream(body),
            RpcContentType::StreamProto,
            CompressionEncoding::Identity,
        );
        assert_eq!(stream.next().await.unwrap().unwrap().name, "a");
        assert_eq!(stream.next().await.unwrap().unwrap().name, "b");
        assert!(stream.next().await.is_none());
        assert_eq!(stream.trailers(), Some(Trailers::new()));
    }

    #[tokio::test]
    async fn error_end_stream_raises_after_yielded_messages() {
        let mut body = wrap_envelope(&Item { name: "ok".into() }.encode_to_vec(), false);
        let err = ConnectError::permission_denied("stop");
        body.extend_from_slice(&wrap_end_stream(&end_stream_json(Some(&err), None)));

        let mut stream = Streaming::<Item>::from_body(
            body_stream(body),
            RpcContentType::StreamProto,
            CompressionEncoding::Identity,
        );
        assert_eq!(stream.next().await.unwrap().unwrap().name, "ok");
        let failure = stream.next().await.unwrap().unwrap_err();
        assert_eq!(failure.code(), Code::PermissionDenied);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn missing_end_stream_is_a_protocol_error() {
        let body = wrap_envelope(&Item { name: "only".into() }.encode_to_vec(), false);
        let mut stream = Streaming::<Item>::from_body(
            body_stream(body),
            RpcContentType::StreamProto,
            CompressionEncoding::Identity,
        );
        assert!(stream.next().await.unwrap().is_ok());
        let failure = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(failure, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn trailers_from_end_stream_metadata() {
        let err_free = end_stream_json(
            None,
            Some(&{
                let mut map = http::HeaderMap::new();
                map.insert("x-count", http::HeaderValue::from_static("2"));
                map
            }),
        );
        let mut body = wrap_envelope(&Item { name: "x".into() }.encode_to_vec(), false);
        body.extend_from_slice(&wrap_end_stream(&err_free));

        let mut stream = Streaming::<Item>::from_body(
            body_stream(body),
            RpcContentType::StreamProto,
            CompressionEncoding::Identity,
        );
        while stream.next().await.is_some() {}
        let trailers = stream.trailers().unwrap();
        assert_eq!(trailers.get("x-count").unwrap(), &vec!["2".to_string()]);
    }

    #[test]
    fn decode_single_happy_path() {
        let mut body = wrap_envelope(&Item { name: "sum".into() }.encode_to_vec(), false);
        body.extend_from_slice(&wrap_end_stream(b"{}"));
        let (message, trailers) = decode_single::<Item>(
            &body,
            RpcContentType::StreamProto,
            CompressionEncoding::Identity,
        )
        .unwrap();
        assert_eq!(message.name, "sum");
        assert!(trailers.is_empty());
    }

    #[test]
    fn decode_single_rejects_extra_messages() {
        let one = wrap_envelope(&Item { name: "a".into() }.encode_to_vec(), false);
        let mut body = one.clone();
        body.extend_from_slice(&one);
        body.extend_from_slice(&wrap_end_stream(b"{}"));
        let err = decode_single::<Item>(
            &body,
            RpcContentType::StreamProto,
            CompressionEncoding::Identity,
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }
}

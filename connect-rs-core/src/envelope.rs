//! Streaming envelope framing.
//!
//! Streaming bodies are sequences of frames:
//!
//! ```text
//! [flags:1][length:4 big-endian][payload:length]
//! ```
//!
//! Flag bit 0 marks a compressed payload, flag bit 1 the end-of-stream frame
//! whose payload is the JSON object produced by
//! [`end_stream_json`](crate::error::end_stream_json).

use bytes::{Buf, Bytes, BytesMut};

use crate::compression::CompressionEncoding;
use crate::error::{Code, ConnectError};

/// Envelope flag bits.
pub mod flags {
    /// Plain message frame.
    pub const MESSAGE: u8 = 0x00;
    /// Payload is compressed with the stream's negotiated encoding.
    pub const COMPRESSED: u8 = 0x01;
    /// End-of-stream frame; must be the last frame in the body.
    pub const END_STREAM: u8 = 0x02;
}

/// Size of the flags + length prefix.
pub const ENVELOPE_HEADER_LEN: usize = 5;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & flags::COMPRESSED != 0
    }
}

/// Wrap a payload in an envelope.
pub fn wrap_envelope(payload: &[u8], compressed: bool) -> Vec<u8> {
    let flags = if compressed {
        flags::COMPRESSED
    } else {
        flags::MESSAGE
    };
    let mut frame = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    frame.push(flags);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build an end-of-stream frame around an already-serialized JSON payload.
pub fn wrap_end_stream(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    frame.push(flags::END_STREAM);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Validate a message frame's flags and decompress its payload if flagged.
///
/// Returns `None` for end-of-stream frames; the caller handles those.
pub fn open_frame(
    frame: Frame,
    encoding: CompressionEncoding,
) -> Result<Option<Bytes>, ConnectError> {
    if frame.is_end_stream() {
        return Ok(None);
    }
    if frame.flags != flags::MESSAGE && frame.flags != flags::COMPRESSED {
        return Err(ConnectError::new(
            Code::InvalidArgument,
            format!("invalid envelope flags: 0x{:02x}", frame.flags),
        ));
    }
    if frame.is_compressed() {
        crate::compression::decompress(frame.payload, encoding).map(Some)
    } else {
        Ok(Some(frame.payload))
    }
}

/// Resumable envelope decoder.
///
/// Bytes arrive in arbitrary chunks via [`push`](Self::push); complete frames
/// come out of [`next_frame`](Self::next_frame) one at a time as soon as the
/// declared length is satisfied. The decoder never buffers past the frame it
/// is currently assembling, and rejects declared payloads over the configured
/// limit before reserving space for them.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buf: BytesMut,
    max_payload: Option<usize>,
    seen_end_stream: bool,
}

impl EnvelopeDecoder {
    pub fn new(max_payload: Option<usize>) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload,
            seen_end_stream: false,
        }
    }

    /// Feed a chunk of body bytes into the decoder.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pull the next complete frame, if one is buffered.
    ///
    /// Errors:
    /// - `resource_exhausted` when the declared length exceeds the limit
    /// - `invalid_argument` for bytes after the end-of-stream frame
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ConnectError> {
        if self.buf.len() < ENVELOPE_HEADER_LEN {
            if self.seen_end_stream && !self.buf.is_empty() {
                return Err(trailing_bytes_error(self.buf.len()));
            }
            return Ok(None);
        }
        if self.seen_end_stream {
            return Err(trailing_bytes_error(self.buf.len()));
        }

        let frame_flags = self.buf[0];
        let length =
            u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;

        if let Some(max) = self.max_payload
            && length > max
        {
            return Err(ConnectError::new(
                Code::ResourceExhausted,
                format!(
                    "message size {} bytes exceeds maximum allowed size of {} bytes",
                    length, max
                ),
            ));
        }

        if self.buf.len() < ENVELOPE_HEADER_LEN + length {
            self.buf
                .reserve(ENVELOPE_HEADER_LEN + length - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(ENVELOPE_HEADER_LEN);
        let payload = self.buf.split_to(length).freeze();
        let frame = Frame {
            flags: frame_flags,
            payload,
        };
        if frame.is_end_stream() {
            self.seen_end_stream = true;
        }
        Ok(Some(frame))
    }

    /// Signal end of input. Errors with `internal` if the body stopped in the
    /// middle of a frame.
    pub fn finish(&self) -> Result<(), ConnectError> {
        if self.buf.is_empty() {
            Ok(())
        } else if self.seen_end_stream {
            Err(trailing_bytes_error(self.buf.len()))
        } else {
            Err(ConnectError::new(
                Code::Internal,
                format!(
                    "incomplete envelope: stream ended with {} buffered bytes",
                    self.buf.len()
                ),
            ))
        }
    }

    /// Whether an end-of-stream frame has been decoded.
    pub fn saw_end_stream(&self) -> bool {
        self.seen_end_stream
    }
}

fn trailing_bytes_error(count: usize) -> ConnectError {
    ConnectError::new(
        Code::InvalidArgument,
        format!("{count} bytes after end-of-stream frame"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionCodec;

    fn decode_all(bytes: &[u8]) -> Result<Vec<Frame>, ConnectError> {
        let mut decoder = EnvelopeDecoder::new(None);
        decoder.push(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame()? {
            frames.push(frame);
        }
        decoder.finish()?;
        Ok(frames)
    }

    #[test]
    fn round_trip_all_flag_combinations() {
        for flags_byte in [0u8, 1, 2, 3] {
            for payload in [&b""[..], b"x", b"hello envelope"] {
                let mut frame = Vec::new();
                frame.push(flags_byte);
                frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                frame.extend_from_slice(payload);

                let mut decoder = EnvelopeDecoder::new(None);
                decoder.push(&frame);
                let decoded = decoder.next_frame().unwrap().unwrap();
                assert_eq!(decoded.flags, flags_byte);
                assert_eq!(&decoded.payload[..], payload);
                assert!(decoder.next_frame().is_ok());
                decoder.finish().unwrap();
            }
        }
    }

    #[test]
    fn wrap_envelope_sets_flags_and_length() {
        let frame = wrap_envelope(b"hello", false);
        assert_eq!(frame[0], flags::MESSAGE);
        assert_eq!(u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]), 5);
        assert_eq!(&frame[5..], b"hello");

        let frame = wrap_envelope(b"hello", true);
        assert_eq!(frame[0], flags::COMPRESSED);
    }

    #[test]
    fn decoder_resumes_across_chunk_boundaries() {
        let frame = wrap_envelope(b"split me", false);
        let mut decoder = EnvelopeDecoder::new(None);
        for chunk in frame.chunks(3) {
            decoder.push(chunk);
        }
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&decoded.payload[..], b"split me");
    }

    #[test]
    fn decoder_yields_frames_one_at_a_time() {
        let mut body = wrap_envelope(b"one", false);
        body.extend_from_slice(&wrap_envelope(b"two", false));
        body.extend_from_slice(&wrap_end_stream(b"{}"));

        let frames = decode_all(&body).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0].payload[..], b"one");
        assert_eq!(&frames[1].payload[..], b"two");
        assert!(frames[2].is_end_stream());
    }

    #[test]
    fn oversized_payload_is_resource_exhausted() {
        let frame = wrap_envelope(&[0u8; 64], false);
        let mut decoder = EnvelopeDecoder::new(Some(16));
        decoder.push(&frame);
        let err = decoder.next_frame().unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }

    #[test]
    fn bytes_after_end_stream_are_rejected() {
        let mut body = wrap_end_stream(b"{}");
        body.extend_from_slice(&wrap_envelope(b"late", false));
        let err = decode_all(&body).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn truncated_frame_is_internal_on_finish() {
        let frame = wrap_envelope(b"truncated", false);
        let mut decoder = EnvelopeDecoder::new(None);
        decoder.push(&frame[..7]);
        assert!(decoder.next_frame().unwrap().is_none());
        let err = decoder.finish().unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn open_frame_rejects_unknown_flags() {
        let frame = Frame {
            flags: 0xff,
            payload: Bytes::new(),
        };
        let err = open_frame(frame, CompressionEncoding::Identity).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn open_frame_decompresses_flagged_payloads() {
        let codec = crate::compression::GzipCompression::default();
        let compressed = codec.compress(b"payload").unwrap();
        let frame = Frame {
            flags: flags::COMPRESSED,
            payload: compressed,
        };
        let opened = open_frame(frame, CompressionEncoding::Gzip).unwrap().unwrap();
        assert_eq!(&opened[..], b"payload");
    }
}

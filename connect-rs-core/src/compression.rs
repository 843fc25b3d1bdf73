//! Compression codecs and encoding negotiation.
//!
//! `identity` and `gzip` are always available; `br` and `zstd` are behind the
//! `compression-br` / `compression-zstd` features. `identity` is an implicit
//! member of every Accept-Encoding set.

use std::io;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::Compression as GzipLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Code, ConnectError};

/// A compression codec keyed by its HTTP encoding token.
pub trait CompressionCodec: Send + Sync + 'static {
    /// The encoding token for HTTP headers (e.g. "gzip").
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> io::Result<Bytes>;

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes>;
}

/// A reference-counted codec for type-erased storage.
///
/// `Option<BoxedCompression>` is used throughout, with `None` standing for
/// identity so the common uncompressed path stays zero-copy.
#[derive(Clone)]
pub struct BoxedCompression(Arc<dyn CompressionCodec>);

impl BoxedCompression {
    pub fn new<C: CompressionCodec>(codec: C) -> Self {
        BoxedCompression(Arc::new(codec))
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        self.0.compress(data)
    }

    pub fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        self.0.decompress(data)
    }
}

impl std::fmt::Debug for BoxedCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BoxedCompression").field(&self.name()).finish()
    }
}

/// Gzip codec backed by flate2.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompression {
    /// Compression level (0-9).
    pub level: u32,
}

impl Default for GzipCompression {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl GzipCompression {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl CompressionCodec for GzipCompression {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::new(), GzipLevel::new(self.level));
        encoder.write_all(data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    }
}

/// The no-op codec. Compress and decompress are bit-identical.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCompression;

impl CompressionCodec for IdentityCompression {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Brotli codec. Requires the `compression-br` feature.
#[cfg(feature = "compression-br")]
#[derive(Debug, Clone, Copy)]
pub struct BrotliCompression {
    /// Compression quality (0-11).
    pub quality: u32,
}

#[cfg(feature = "compression-br")]
impl Default for BrotliCompression {
    fn default() -> Self {
        Self { quality: 4 }
    }
}

#[cfg(feature = "compression-br")]
impl BrotliCompression {
    pub fn with_quality(quality: u32) -> Self {
        Self {
            quality: quality.min(11),
        }
    }
}

#[cfg(feature = "compression-br")]
impl CompressionCodec for BrotliCompression {
    fn name(&self) -> &'static str {
        "br"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        use brotli::enc::BrotliEncoderParams;
        let mut out = Vec::new();
        let params = BrotliEncoderParams {
            quality: self.quality as i32,
            ..Default::default()
        };
        brotli::enc::BrotliCompress(&mut io::Cursor::new(data), &mut out, &params)?;
        Ok(Bytes::from(out))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut out = Vec::new();
        brotli::BrotliDecompress(&mut io::Cursor::new(data), &mut out)?;
        Ok(Bytes::from(out))
    }
}

/// Zstd codec. Requires the `compression-zstd` feature.
#[cfg(feature = "compression-zstd")]
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompression {
    /// Compression level (1-22).
    pub level: i32,
}

#[cfg(feature = "compression-zstd")]
impl Default for ZstdCompression {
    fn default() -> Self {
        Self { level: 3 }
    }
}

#[cfg(feature = "compression-zstd")]
impl ZstdCompression {
    pub fn with_level(level: i32) -> Self {
        Self {
            level: level.clamp(1, 22),
        }
    }
}

#[cfg(feature = "compression-zstd")]
impl CompressionCodec for ZstdCompression {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        let compressed = zstd::bulk::compress(data, self.level).map_err(io::Error::other)?;
        Ok(Bytes::from(compressed))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut decoder = zstd::Decoder::new(data)?;
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    }
}

/// Supported compression encodings, used for header parsing and negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionEncoding {
    #[default]
    Identity,
    Gzip,
    #[cfg(feature = "compression-br")]
    Brotli,
    #[cfg(feature = "compression-zstd")]
    Zstd,
}

impl CompressionEncoding {
    /// Parse a Content-Encoding / Connect-Content-Encoding value.
    ///
    /// Returns `None` for encodings this build cannot decompress; the caller
    /// reports those as `unimplemented`.
    pub fn from_header(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("identity") | Some("") => Some(Self::Identity),
            Some("gzip") => Some(Self::Gzip),
            #[cfg(feature = "compression-br")]
            Some("br") => Some(Self::Brotli),
            #[cfg(feature = "compression-zstd")]
            Some("zstd") => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            #[cfg(feature = "compression-br")]
            Self::Brotli => "br",
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => "zstd",
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// The codec for this encoding; `None` for identity.
    pub fn codec(&self) -> Option<BoxedCompression> {
        match self {
            Self::Identity => None,
            Self::Gzip => Some(BoxedCompression::new(GzipCompression::default())),
            #[cfg(feature = "compression-br")]
            Self::Brotli => Some(BoxedCompression::new(BrotliCompression::default())),
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => Some(BoxedCompression::new(ZstdCompression::default())),
        }
    }

    /// The codec for this encoding at a chosen level; `None` for identity.
    pub fn codec_with_level(&self, level: CompressionLevel) -> Option<BoxedCompression> {
        match self {
            Self::Identity => None,
            Self::Gzip => Some(BoxedCompression::new(GzipCompression::with_level(
                level.gzip(),
            ))),
            #[cfg(feature = "compression-br")]
            Self::Brotli => Some(BoxedCompression::new(BrotliCompression::with_quality(
                level.brotli(),
            ))),
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => Some(BoxedCompression::new(ZstdCompression::with_level(
                level.zstd(),
            ))),
        }
    }
}

/// Compression level, interpreted per algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    Fastest,
    Best,
    #[default]
    Default,
    /// Algorithm-specific value: gzip 0-9, brotli 0-11, zstd 1-22.
    Precise(u32),
}

impl CompressionLevel {
    fn gzip(self) -> u32 {
        match self {
            Self::Fastest => 1,
            Self::Best => 9,
            Self::Default => 6,
            Self::Precise(n) => n.clamp(0, 9),
        }
    }

    #[cfg(feature = "compression-br")]
    fn brotli(self) -> u32 {
        match self {
            Self::Fastest => 0,
            Self::Best => 11,
            Self::Default => 4,
            Self::Precise(n) => n.clamp(0, 11),
        }
    }

    #[cfg(feature = "compression-zstd")]
    fn zstd(self) -> i32 {
        match self {
            Self::Fastest => 1,
            Self::Best => 22,
            Self::Default => 3,
            Self::Precise(n) => (n as i32).clamp(1, 22),
        }
    }
}

/// Compression behavior for outgoing messages.
#[derive(Debug, Clone, Copy)]
pub struct CompressionConfig {
    /// Minimum payload size before compression is applied. Messages smaller
    /// than this are sent uncompressed.
    pub min_bytes: usize,
    pub level: CompressionLevel,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_bytes: 0,
            level: CompressionLevel::Default,
        }
    }
}

impl CompressionConfig {
    pub fn new(min_bytes: usize) -> Self {
        Self {
            min_bytes,
            level: CompressionLevel::Default,
        }
    }

    pub fn level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    pub fn disabled() -> Self {
        Self {
            min_bytes: usize::MAX,
            level: CompressionLevel::Default,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.min_bytes == usize::MAX
    }
}

/// Comma-separated tokens this build can decompress, for Accept-Encoding
/// advertisement and unimplemented-encoding error messages.
pub fn supported_encodings() -> &'static str {
    #[cfg(all(feature = "compression-br", feature = "compression-zstd"))]
    {
        "gzip, br, zstd, identity"
    }
    #[cfg(all(feature = "compression-br", not(feature = "compression-zstd")))]
    {
        "gzip, br, identity"
    }
    #[cfg(all(not(feature = "compression-br"), feature = "compression-zstd"))]
    {
        "gzip, zstd, identity"
    }
    #[cfg(all(not(feature = "compression-br"), not(feature = "compression-zstd")))]
    {
        "gzip, identity"
    }
}

/// Pick the response encoding from an Accept-Encoding header value.
///
/// First supported token wins (client preference order); `q=0` marks a token
/// as unacceptable per RFC 7231. Absent or empty headers mean identity.
pub fn negotiate_response_encoding(accept: Option<&str>) -> CompressionEncoding {
    let Some(accept) = accept else {
        return CompressionEncoding::Identity;
    };

    for token in accept.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let (encoding, q_value) = match token.split_once(';') {
            Some((enc, params)) => {
                let q = params.split(';').find_map(|p| p.trim().strip_prefix("q="));
                (enc.trim(), q)
            }
            None => (token, None),
        };

        // q=0 means "not acceptable" per RFC 7231
        if let Some(q) = q_value
            && matches!(q.trim(), "0" | "0.0" | "0.00" | "0.000")
        {
            continue;
        }

        match CompressionEncoding::from_header(Some(encoding)) {
            Some(enc) => return enc,
            None => continue,
        }
    }

    CompressionEncoding::Identity
}

/// Decompress with the named encoding. Failures are `invalid_argument`: the
/// peer claimed an encoding the bytes do not satisfy.
pub fn decompress(bytes: Bytes, encoding: CompressionEncoding) -> Result<Bytes, ConnectError> {
    let Some(codec) = encoding.codec() else {
        return Ok(bytes);
    };
    codec
        .decompress(&bytes)
        .map_err(|e| ConnectError::new(Code::InvalidArgument, format!("decompression failed: {e}")))
}

/// Compress if the encoding is not identity and the payload meets the
/// configured threshold. Returns `(data, was_compressed)`; falls back to the
/// uncompressed bytes on codec failure.
pub fn maybe_compress(
    data: Vec<u8>,
    encoding: CompressionEncoding,
    config: &CompressionConfig,
) -> (Vec<u8>, bool) {
    if encoding.is_identity() || data.len() < config.min_bytes {
        return (data, false);
    }
    match encoding.codec_with_level(config.level) {
        Some(codec) => match codec.compress(&data) {
            Ok(compressed) => (compressed.to_vec(), true),
            Err(_) => (data, false),
        },
        None => (data, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let codec = GzipCompression::default();
        let original = b"a body long enough that gzip actually shrinks it ............";
        let compressed = codec.compress(original).unwrap();
        assert_ne!(&compressed[..], &original[..]);
        assert_eq!(&codec.decompress(&compressed).unwrap()[..], &original[..]);
    }

    #[test]
    fn identity_is_bit_identical() {
        let codec = IdentityCompression;
        let original = b"hello";
        assert_eq!(&codec.compress(original).unwrap()[..], &original[..]);
        assert_eq!(&codec.decompress(original).unwrap()[..], &original[..]);
    }

    #[test]
    fn from_header_rejects_unsupported() {
        assert_eq!(
            CompressionEncoding::from_header(None),
            Some(CompressionEncoding::Identity)
        );
        assert_eq!(
            CompressionEncoding::from_header(Some("gzip")),
            Some(CompressionEncoding::Gzip)
        );
        assert_eq!(CompressionEncoding::from_header(Some("lz4")), None);
    }

    #[test]
    fn negotiation_prefers_client_order() {
        assert_eq!(
            negotiate_response_encoding(Some("gzip, identity")),
            CompressionEncoding::Gzip
        );
        assert_eq!(
            negotiate_response_encoding(Some("identity, gzip")),
            CompressionEncoding::Identity
        );
        assert_eq!(
            negotiate_response_encoding(Some("lz4, gzip")),
            CompressionEncoding::Gzip
        );
        assert_eq!(negotiate_response_encoding(None), CompressionEncoding::Identity);
    }

    #[test]
    fn negotiation_respects_q_zero() {
        assert_eq!(
            negotiate_response_encoding(Some("gzip;q=0")),
            CompressionEncoding::Identity
        );
        assert_eq!(
            negotiate_response_encoding(Some("gzip;q=0.0, identity")),
            CompressionEncoding::Identity
        );
        assert_eq!(
            negotiate_response_encoding(Some("gzip;q=0.5")),
            CompressionEncoding::Gzip
        );
    }

    #[test]
    fn maybe_compress_honors_threshold() {
        let config = CompressionConfig::new(1024);
        let (data, compressed) =
            maybe_compress(vec![0u8; 10], CompressionEncoding::Gzip, &config);
        assert!(!compressed);
        assert_eq!(data.len(), 10);

        let (_, compressed) =
            maybe_compress(vec![0u8; 4096], CompressionEncoding::Gzip, &config);
        assert!(compressed);
    }

    #[test]
    fn decompress_invalid_bytes_is_invalid_argument() {
        let err = decompress(Bytes::from_static(b"not gzip"), CompressionEncoding::Gzip)
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn supported_encodings_always_lists_identity() {
        assert!(supported_encodings().contains("identity"));
        assert!(supported_encodings().contains("gzip"));
    }
}

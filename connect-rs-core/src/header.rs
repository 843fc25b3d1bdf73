//! Header parsing helpers: timeout, protocol version, binary metadata.

use std::time::Duration;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use http::{HeaderMap, HeaderValue};

use crate::error::{Code, ConnectError};
use crate::protocol::{PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER, TIMEOUT_HEADER};

// Binary metadata is emitted unpadded; peers send both.
const STANDARD_INDIFFERENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Parse the `Connect-Timeout-Ms` header.
///
/// The value must be a non-negative decimal integer that fits in 64 bits;
/// anything else is `invalid_argument`. `0` and an absent header both mean no
/// timeout.
pub fn parse_timeout(headers: &HeaderMap) -> Result<Option<Duration>, ConnectError> {
    let Some(value) = headers.get(TIMEOUT_HEADER) else {
        return Ok(None);
    };
    let text = value.to_str().map_err(|_| bad_timeout())?;
    let ms: u64 = text.parse().map_err(|_| bad_timeout())?;
    if ms == 0 {
        Ok(None)
    } else {
        Ok(Some(Duration::from_millis(ms)))
    }
}

fn bad_timeout() -> ConnectError {
    ConnectError::new(
        Code::InvalidArgument,
        format!("{TIMEOUT_HEADER} must be a non-negative integer of milliseconds"),
    )
}

/// Validate the `Connect-Protocol-Version` header.
///
/// When present the value must be exactly `1`. Requiring its presence is a
/// server configuration switch so ad-hoc curl requests keep working by
/// default.
pub fn validate_protocol_version(
    headers: &HeaderMap,
    require_header: bool,
) -> Result<(), ConnectError> {
    match headers.get(PROTOCOL_VERSION_HEADER).map(|v| v.to_str()) {
        Some(Ok(PROTOCOL_VERSION)) => Ok(()),
        Some(Ok(other)) => Err(ConnectError::new(
            Code::InvalidArgument,
            format!("{PROTOCOL_VERSION_HEADER} must be \"{PROTOCOL_VERSION}\": got \"{other}\""),
        )),
        Some(Err(_)) => Err(ConnectError::new(
            Code::InvalidArgument,
            format!("{PROTOCOL_VERSION_HEADER} must be \"{PROTOCOL_VERSION}\""),
        )),
        None if require_header => Err(ConnectError::new(
            Code::InvalidArgument,
            format!("missing required header: set {PROTOCOL_VERSION_HEADER} to \"{PROTOCOL_VERSION}\""),
        )),
        None => Ok(()),
    }
}

/// Whether a header name carries binary metadata (`-Bin` suffix,
/// case-insensitive).
pub fn is_binary_header(name: &str) -> bool {
    let len = name.len();
    len > 4 && name[len - 4..].eq_ignore_ascii_case("-bin")
}

/// Encode raw bytes as a binary metadata header value.
pub fn encode_binary_value(bytes: &[u8]) -> HeaderValue {
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes);
    HeaderValue::from_str(&encoded).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Decode a binary metadata header value into raw bytes.
pub fn decode_binary_value(value: &HeaderValue) -> Result<Vec<u8>, ConnectError> {
    let text = value
        .to_str()
        .map_err(|_| ConnectError::invalid_argument("binary metadata is not valid base64"))?;
    STANDARD_INDIFFERENT
        .decode(text)
        .map_err(|_| ConnectError::invalid_argument("binary metadata is not valid base64"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn timeout_parses_milliseconds() {
        let headers = headers_with(TIMEOUT_HEADER, "1500");
        assert_eq!(
            parse_timeout(&headers).unwrap(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn timeout_zero_and_absent_mean_none() {
        assert_eq!(parse_timeout(&HeaderMap::new()).unwrap(), None);
        let headers = headers_with(TIMEOUT_HEADER, "0");
        assert_eq!(parse_timeout(&headers).unwrap(), None);
    }

    #[test]
    fn timeout_rejects_garbage() {
        for bad in ["abc", "-1", "1.5", "", "99999999999999999999999"] {
            let headers = headers_with(TIMEOUT_HEADER, bad);
            let err = parse_timeout(&headers).unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument, "value {bad:?}");
        }
    }

    #[test]
    fn protocol_version_accepts_exactly_one() {
        let headers = headers_with(PROTOCOL_VERSION_HEADER, "1");
        assert!(validate_protocol_version(&headers, true).is_ok());

        let headers = headers_with(PROTOCOL_VERSION_HEADER, "2");
        let err = validate_protocol_version(&headers, false).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn protocol_version_presence_is_configurable() {
        assert!(validate_protocol_version(&HeaderMap::new(), false).is_ok());
        let err = validate_protocol_version(&HeaderMap::new(), true).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn binary_header_detection() {
        assert!(is_binary_header("trace-context-bin"));
        assert!(is_binary_header("Trace-Context-BIN"));
        assert!(!is_binary_header("content-type"));
        assert!(!is_binary_header("-bin"));
    }

    #[test]
    fn binary_value_round_trip() {
        let value = encode_binary_value(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(decode_binary_value(&value).unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        // Padded input is accepted too.
        let padded = HeaderValue::from_static("3q2+7w==");
        assert_eq!(decode_binary_value(&padded).unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }
}

//! Message size limits for incoming requests.

/// Default maximum message size (4 MB), matching gRPC's default receive
/// limit.
pub const DEFAULT_MAX_RECEIVE_BYTES: usize = 4 * 1024 * 1024;

/// Limit on the size of a single decoded message.
///
/// For unary requests the limit applies to the (decompressed) body; for
/// streams it applies to each envelope payload after decompression. Declared
/// Content-Length values over the limit fail fast before the body is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageLimits {
    max_receive_bytes: Option<usize>,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_receive_bytes: Some(DEFAULT_MAX_RECEIVE_BYTES),
        }
    }
}

impl MessageLimits {
    pub fn new(max_receive_bytes: usize) -> Self {
        Self {
            max_receive_bytes: Some(max_receive_bytes),
        }
    }

    /// No limit. Only suitable for trusted peers.
    pub fn unlimited() -> Self {
        Self {
            max_receive_bytes: None,
        }
    }

    pub fn max_receive_bytes(&self) -> Option<usize> {
        self.max_receive_bytes
    }

    /// The limit as a concrete bound for body readers.
    pub fn max_receive_bytes_or_max(&self) -> usize {
        self.max_receive_bytes.unwrap_or(usize::MAX)
    }

    /// Check a message size against the limit.
    pub fn check_size(&self, size: usize) -> Result<(), String> {
        if let Some(max) = self.max_receive_bytes
            && size > max
        {
            return Err(format!(
                "message size {size} bytes exceeds maximum allowed size of {max} bytes"
            ));
        }
        Ok(())
    }
}

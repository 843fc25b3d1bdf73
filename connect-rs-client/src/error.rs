//! Client-side error type.

use connect_rs_core::{Code, ConnectError};

/// Everything a call can fail with.
///
/// RPC errors carry the server's structured [`ConnectError`]; transport
/// failures (connection refused, reset, DNS) surface as `unavailable`;
/// protocol violations in the server's response surface as `internal`.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Rpc(#[from] ConnectError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// The Connect code for this failure.
    pub fn code(&self) -> Code {
        match self {
            ClientError::Rpc(err) => err.code(),
            ClientError::Transport(_) => Code::Unavailable,
            ClientError::Protocol(_) => Code::Internal,
        }
    }

    /// The structured error, when the server sent one.
    pub fn as_rpc(&self) -> Option<&ConnectError> {
        match self {
            ClientError::Rpc(err) => Some(err),
            _ => None,
        }
    }

    /// Whether retrying the call may succeed. See [`Code::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_unavailable() {
        let err = ClientError::Transport("connection refused".into());
        assert_eq!(err.code(), Code::Unavailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn rpc_errors_keep_their_code() {
        let err = ClientError::Rpc(ConnectError::not_found("missing"));
        assert_eq!(err.code(), Code::NotFound);
        assert!(!err.is_retryable());
        assert_eq!(err.as_rpc().unwrap().message(), Some("missing"));
    }
}

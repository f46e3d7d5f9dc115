//! Network error types.
//!
//! Each layer has its own error enum so callers can match on exactly the
//! failures that layer produces. [`NetworkError`] wraps them for node-level
//! operations.

use std::time::Duration;

/// Failure to establish a connection to a remote peer.
///
/// `Clone` so one dial outcome can be handed to every caller waiting on the
/// same in-flight attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// No route to the address, or the transport failed before the peer answered.
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    /// The remote actively refused the connection or the handshake.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// The dial did not complete within the configured timeout.
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// Another dial to the same identity is already running.
    #[error("Connection attempt already in progress")]
    AlreadyInProgress,
}

/// Failure on a single multiplexed stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The underlying connection closed before or during the operation.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The remote has no handler for the requested protocol.
    #[error("Protocol rejected by remote: {0}")]
    ProtocolRejected(String),

    /// The remote aborted the stream.
    #[error("Stream reset by remote: {0}")]
    Reset(String),
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match err {
            StreamError::ConnectionClosed => std::io::ErrorKind::ConnectionAborted,
            StreamError::ProtocolRejected(_) => std::io::ErrorKind::ConnectionRefused,
            StreamError::Reset(_) => std::io::ErrorKind::ConnectionReset,
        };
        std::io::Error::new(kind, err)
    }
}

/// Chat wire-format violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// The stream ended part-way through a frame.
    #[error("Truncated frame: got {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },

    /// The frame header or payload is invalid.
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Discovery subsystem failure.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Routed discovery could not reach any seed or populate a routing bucket.
    #[error("Routing bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// The local discovery socket could not be set up.
    #[error("Local discovery unavailable: {0}")]
    Socket(#[from] std::io::Error),
}

/// Invalid user input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    /// The text is not a `<peer-id>@<ip>:<port>` address.
    #[error("Unparsable peer address '{input}': {reason}")]
    UnparsableAddress { input: String, reason: String },
}

/// Failure of a chat or routing session over a stream.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("Session I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for SessionError {
    /// Recover the typed stream error carried inside an I/O error when there
    /// is one.
    fn from(err: std::io::Error) -> Self {
        let is_stream_error = err
            .get_ref()
            .is_some_and(|inner| inner.downcast_ref::<StreamError>().is_some());
        if is_stream_error {
            if let Some(inner) = err.into_inner() {
                if let Ok(stream_err) = inner.downcast::<StreamError>() {
                    return Self::Stream(*stream_err);
                }
            }
            return Self::Stream(StreamError::ConnectionClosed);
        }
        Self::Io(err)
    }
}

/// Errors that can occur in node-level operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The transport listener could not be started.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

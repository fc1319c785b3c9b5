//! Error taxonomy shared by every transport.

use std::io;
use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

/// Errors surfaced by servers, connections and streams.
///
/// Transport-level failures are delivered as terminal signals on the
/// affected connection only. Usage errors are returned synchronously.
#[derive(Debug, Error)]
pub enum NetError {
    /// The listening or local resource could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Operation requires a bound resource or an active connection.
    #[error("not running: {0}")]
    NotRunning(&'static str),

    /// `start` was called on a server that is not in the `Unstarted` phase.
    #[error("server already started")]
    AlreadyStarted,

    /// A second consumer tried to attach to a demand bridge.
    #[error("a consumer is already attached to this connection")]
    AlreadySubscribed,

    /// WebSocket handshake failed or was attempted after headers were flushed.
    #[error("websocket upgrade failed: {0}")]
    Upgrade(String),

    /// Response headers were already flushed; they can no longer change.
    #[error("response headers already sent")]
    HeadersSent,

    /// Malformed multipart boundary or truncated body.
    #[error("decode error: {0}")]
    Decode(String),

    /// Peer reset the connection or the pipe broke.
    #[error("connection closed by remote peer")]
    RemoteClosed,

    /// An emission was attempted with no outstanding demand.
    #[error("emission without outstanding demand")]
    NoDemand,

    /// A resource served by a route does not exist or is not readable.
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP 3xx received by a caller awaiting a full response.
    #[error("redirect response {status} to {location:?}")]
    RedirectResponse {
        status: StatusCode,
        location: Option<String>,
    },

    /// HTTP 4xx/5xx received by a caller awaiting a full response.
    #[error("error response {status}")]
    ClientErrorResponse { status: StatusCode },

    /// The start signal never arrived within the deadline.
    #[error("server did not start within {0:?}")]
    StartTimeout(Duration),

    /// Failure raised by application handler code.
    #[error("handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Io(io::Error),

    #[error(transparent)]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl NetError {
    /// Convenience constructor for handler failures.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// True for errors meaning the peer went away.
    pub fn is_remote_closed(&self) -> bool {
        match self {
            NetError::RemoteClosed => true,
            NetError::Io(e) => is_broken_pipe(e),
            _ => false,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        if is_broken_pipe(&err) {
            NetError::RemoteClosed
        } else {
            NetError::Io(err)
        }
    }
}

/// Broken-pipe class of I/O errors.
pub(crate) fn is_broken_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, NetError>;

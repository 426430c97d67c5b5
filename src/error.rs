//! Error types for service-relay.

use tokio_tungstenite::tungstenite::Error as WsError;

use crate::name::ServiceName;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The broker (or a local target) could not be reached.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested listen address.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A broker address this build cannot dial.
    #[error("invalid broker address {0:?}: {1}")]
    InvalidAddress(String, &'static str),

    /// Malformed or unexpected control line.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No live registration exists for the requested name.
    #[error("service not found: {0}")]
    NotFound(ServiceName),

    /// The broker answered with an `ERROR:` reply.
    #[error("broker rejected the request: {0}")]
    Rejected(String),

    /// The authorization hook refused the session.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket handshake or framing error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

impl Error {
    /// Create a protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a connect error for `addr`.
    pub fn connect(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connect {
            addr: addr.into(),
            source,
        }
    }

    /// Whether a caller should retry the operation after backing off.
    ///
    /// Connect failures, timeouts, and lost connections are transient. A
    /// rejection by the broker or a bad URL is not retried immediately by
    /// the agents.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Timeout(_) | Self::Io(_) => true,
            Self::WebSocket(e) => !matches!(e, WsError::Url(_)),
            _ => false,
        }
    }
}

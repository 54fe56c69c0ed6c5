//! Shared error types for Netron.

use crate::definition::DefId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the Netron protocol.
#[derive(Error, Debug)]
pub enum NetronError {
    /// The operation is not provided by this kind of peer.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// No definition with this id is known.
    #[error("Unknown definition: {0}")]
    UnknownDefinition(DefId),

    /// No context is attached under this name.
    #[error("Unknown context: {0}")]
    UnknownContext(String),

    /// No peer with this id is known.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// A context with this name is already attached.
    #[error("Context already attached: {0}")]
    ContextExists(String),

    /// The peer went offline while the request was pending, or was offline
    /// when the request was made.
    #[error("Peer disconnected: {0}")]
    PeerDisconnected(String),

    /// A value passed to the API is not acceptable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The remote side failed to execute the request.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// No response arrived within the configured response timeout.
    #[error("Request {request_id} to peer {peer} timed out after {timeout_ms} ms")]
    Timeout {
        /// Peer the request was sent to.
        peer: String,
        /// Correlation id of the request.
        request_id: u64,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The transport failed to deliver a message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The connection handshake did not complete.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The owning Netron instance is gone.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetronError {
    /// Stable name of the variant, used as [`RemoteError::kind`] on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotImplemented(_) => "NotImplemented",
            Self::UnknownDefinition(_) => "UnknownDefinition",
            Self::UnknownContext(_) => "UnknownContext",
            Self::UnknownPeer(_) => "UnknownPeer",
            Self::ContextExists(_) => "ContextExists",
            Self::PeerDisconnected(_) => "PeerDisconnected",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Remote(_) => "Remote",
            Self::Timeout { .. } => "Timeout",
            Self::Transport(_) => "Transport",
            Self::Serialization(_) => "Serialization",
            Self::HandshakeFailed(_) => "HandshakeFailed",
            Self::Config(_) => "Config",
            Self::ShuttingDown => "ShuttingDown",
            Self::Io(_) => "Io",
        }
    }
}

impl From<serde_json::Error> for NetronError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Alias for Result with NetronError.
pub type NetronResult<T> = Result<T, NetronError>;

/// An error as it travels between peers.
///
/// Application errors raised by a context are carried verbatim; protocol
/// errors raised on the serving side are named by their [`NetronError::kind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error class name.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl RemoteError {
    /// Create a new remote error.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<NetronError> for RemoteError {
    fn from(e: NetronError) -> Self {
        match e {
            // A relayed application error keeps its original identity.
            NetronError::Remote(inner) => inner,
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_keeps_kind() {
        let err: RemoteError = NetronError::UnknownDefinition(7).into();
        assert_eq!(err.kind, "UnknownDefinition");
        assert!(err.message.contains('7'));
    }

    #[test]
    fn test_relayed_remote_error_is_verbatim() {
        let original = RemoteError::new("DivisionByZero", "cannot divide 1 by 0");
        let relayed: RemoteError = NetronError::Remote(original.clone()).into();
        assert_eq!(relayed, original);
    }
}

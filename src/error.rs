//! Error types for wirecall.

use thiserror::Error;

/// Category of a handshake failure.
///
/// Pluggable stream layers (TLS, SSH, custom auth) report failures under
/// one of these named categories so callers can distinguish "the server
/// isn't who it claims" from "my credentials were rejected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeCategory {
    /// The remote host failed authentication (e.g. bad server certificate).
    HostAuth,
    /// The local client's credentials were rejected.
    ClientAuth,
    /// Protocol/version negotiation failed.
    Negotiation,
}

impl std::fmt::Display for HandshakeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeCategory::HostAuth => write!(f, "hostAuth"),
            HandshakeCategory::ClientAuth => write!(f, "clientAuth"),
            HandshakeCategory::Negotiation => write!(f, "negotiation"),
        }
    }
}

/// A categorized handshake failure reported by a stream's `start` phase.
#[derive(Debug, Clone, Error)]
#[error("handshake failed ({category}): {message}")]
pub struct HandshakeError {
    /// Which phase of the handshake failed.
    pub category: HandshakeCategory,
    /// Human-readable description.
    pub message: String,
}

impl HandshakeError {
    /// Create a new handshake error.
    pub fn new(category: HandshakeCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// Main error type for all wirecall operations.
#[derive(Debug, Error)]
pub enum WirecallError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Protocol error (bad frame header, malformed envelope, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer has no handler registered for the requested method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The peer replied with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// The call was cancelled before a reply arrived (connection reset,
    /// explicit close, or caller-side cancel).
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// No connected stream to write to.
    #[error("no active stream")]
    NoActiveStream,

    /// The offline call queue is full.
    #[error("call queue overflow")]
    QueueOverflow,

    /// Push after flush on a pipeliner.
    #[error("pipeliner already flushed")]
    PipelinerClosed,

    /// Connection handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

/// Result type alias using WirecallError.
pub type Result<T> = std::result::Result<T, WirecallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_method_message_names_method() {
        let err = WirecallError::UnknownMethod("P.1.bogus".to_string());
        assert_eq!(err.to_string(), "unknown method: P.1.bogus");
    }

    #[test]
    fn test_handshake_category_display() {
        assert_eq!(HandshakeCategory::HostAuth.to_string(), "hostAuth");
        assert_eq!(HandshakeCategory::ClientAuth.to_string(), "clientAuth");
        assert_eq!(HandshakeCategory::Negotiation.to_string(), "negotiation");
    }

    #[test]
    fn test_handshake_error_wraps_into_wirecall_error() {
        let hs = HandshakeError::new(HandshakeCategory::Negotiation, "version mismatch");
        let err: WirecallError = hs.into();
        assert!(err.to_string().contains("negotiation"));
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: WirecallError = io.into();
        assert!(matches!(err, WirecallError::Io(_)));
    }
}

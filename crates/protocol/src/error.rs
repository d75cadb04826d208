//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
///
/// The type is `Clone` so that a single handshake outcome can be shared with
/// every caller waiting on the same in-flight connect.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // Handshake errors
    /// The connect handshake was rejected or could not complete.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer broke the wire protocol (bad first frame, missing nonce, ...).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation attempted while the transport is not open.
    #[error("not connected")]
    NotConnected,

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // Remote errors
    /// Application-level error reported by the gateway for one request.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// Machine-readable error code from the gateway.
        code: String,
        /// Human-readable message, preserved verbatim.
        message: String,
        /// Optional structured details.
        details: Option<serde_json::Value>,
    },

    // Persistence errors
    /// The injected storage capability failed. Fatal for identity handling.
    #[error("storage failed: {0}")]
    Storage(String),
}

impl ProtocolError {
    /// Builds an `Rpc` error from a wire error shape.
    pub fn rpc(code: impl Into<String>, message: impl Into<String>) -> Self {
        ProtocolError::Rpc {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// The error code, for `Rpc` errors; empty otherwise.
    pub fn code(&self) -> &str {
        match self {
            ProtocolError::Rpc { code, .. } => code,
            _ => "",
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}

// src/error.rs
//! Error taxonomy for the DID messaging node.
//!
//! Cryptographic and identity errors always surface to the caller. Transport
//! errors surface as a `false` return from `SimpleNode::send_message` while
//! the full cause is logged; inbound envelopes that fail verification are
//! dropped and counted, never raised to the receiver.

use thiserror::Error;

/// Errors produced by node operations.
///
/// `Clone` lets a failed connection attempt be shared with every caller
/// that joined the same in-flight establishment.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    /// Key generation or signing failed. Non-retryable without new entropy.
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    /// Externally supplied identity data is inconsistent (DID, key, and
    /// document do not agree). Never silently repaired.
    #[error("identity mismatch: {0}")]
    IdentityMismatch(String),

    /// A DID Document failed parsing or its self-signature/derivation checks.
    #[error("invalid DID document: {0}")]
    DocumentInvalid(String),

    /// A DID could not be resolved to a document (malformed or unreachable).
    #[error("DID resolution failed: {0}")]
    Resolution(String),

    /// An outbound connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// A dial, handshake, or resolution lookup exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The mutual-authentication handshake failed. The peer is untrusted and
    /// the connection is discarded, never upgraded.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Operation attempted during or after shutdown.
    #[error("node is stopped")]
    NodeStopped,

    /// `run()` called while the node is already running.
    #[error("node is already running")]
    AlreadyRunning,

    /// JSON encoding/decoding failure outside of document validation.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NodeError>;

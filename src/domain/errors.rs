//! Domain error types
//!
//! This module defines the error hierarchy for the exporter. All errors are
//! domain-specific and don't expose third-party types.

use thiserror::Error;

/// Main exporter error type
///
/// This is the primary error type used throughout the application.
/// It wraps specific error types and provides context for error handling.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// TEE3 transport errors
    #[error("TEE3 error: {0}")]
    Tee3(#[from] Tee3Error),

    /// Event store errors
    #[error("Database error: {0}")]
    Database(String),

    /// Key derivation, blob decryption and signing errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Payload decode/encode errors
    #[error("Codec error: {0}")]
    Codec(String),

    /// Account lookup errors
    #[error("Account lookup error: {0}")]
    AccountLookup(String),

    /// Audit sink errors
    #[error("Audit error: {0}")]
    Audit(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Generic errors with context
    #[error("{0}")]
    Other(String),
}

/// TEE3 transport errors
///
/// Errors raised by a secure channel, its outer HTTPS connection, the
/// endpoint set and the connection pools.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Tee3Error {
    /// The M1..M4 key exchange did not complete
    #[error("TEE3 handshake failed: {0}")]
    HandshakeFailed(String),

    /// The outer HTTP response was not 200
    #[error("Outer response status is not '200 OK': {0}")]
    OuterResponseNotOk(u16),

    /// The decrypted inner response carried trailing bytes
    #[error("Extra bytes in decrypted inner response.")]
    ExtraBytesInDecryptedResponse,

    /// The server discarded the session and asks for a new handshake
    #[error("TEE Server requested restart")]
    Restart,

    /// The peer reset the connection
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    /// A response body ended early
    #[error("Stream truncated: {0}")]
    StreamTruncated(String),

    /// The channel has no open outer connection
    #[error("Not connected")]
    NotConnected,

    /// Connect, handshake, send or receive took too long
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Freshness retrieval or bearer token submission failed
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// The server sent something the protocol does not allow
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The server's TLS certificate did not pass verification
    #[error("Server certificate rejected: {0}")]
    CertificateRejected(String),

    /// DNS resolution failed or returned nothing
    #[error("Failed to resolve {0}")]
    Resolve(String),

    /// No pool was registered for the host
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    /// The pool stopped handing out channels
    #[error("Connection pool closed for host {0}")]
    PoolClosed(String),
}

impl Tee3Error {
    /// Returns true when the caller should drop the session, reconnect and
    /// resend the same request.
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            Tee3Error::Restart
                | Tee3Error::StreamTruncated(_)
                | Tee3Error::ConnectionReset(_)
                | Tee3Error::NotConnected
        )
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for ExporterError {
    fn from(err: std::io::Error) -> Self {
        ExporterError::Io(err.to_string())
    }
}

// Conversion from serde_json::Error
impl From<serde_json::Error> for ExporterError {
    fn from(err: serde_json::Error) -> Self {
        ExporterError::Serialization(err.to_string())
    }
}

// Conversion from toml parse errors
impl From<toml::de::Error> for ExporterError {
    fn from(err: toml::de::Error) -> Self {
        ExporterError::Configuration(format!("TOML parse error: {err}"))
    }
}

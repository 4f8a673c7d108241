//! Error types for the SMTP server.

use std::io;

use thiserror::Error;

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error during connection operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection was closed by peer.
    #[error("Connection closed by peer")]
    Closed,

    /// Formatting error while preparing response.
    #[error("Response formatting error: {0}")]
    Format(#[from] std::fmt::Error),
}

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// I/O error during TLS operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load TLS certificate.
    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to load TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// STARTTLS issued on a connection that is already TLS.
    #[error("Connection is already TLS")]
    AlreadyTls,

    /// TLS handshake or upgrade failed.
    #[error("TLS upgrade failed: {0}")]
    UpgradeFailed(String),

    /// Negotiated session is missing protocol information.
    #[error("TLS session missing {0}")]
    ProtocolInfoMissing(String),

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

impl From<ConnectionError> for postern_common::error::SessionError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Io(io) => Self::Connection(io),
            ConnectionError::Closed => Self::Protocol("Connection closed by peer".to_string()),
            ConnectionError::Format(fmt) => Self::Protocol(fmt.to_string()),
        }
    }
}

/// Specialized `Result` type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Specialized `Result` type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

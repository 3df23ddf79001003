//! Error types for the honeypot
//!
//! Errors that reach the remote peer are always sanitized: the peer learns
//! that something failed, never why. Full detail only goes to the local
//! tracing output and the telemetry files.

use thiserror::Error;

/// Result type alias for honeypot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Honeypot error types
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport error (handshake, channel, key material)
    #[error("SSH error: {0}")]
    Ssh(String),

    /// SFTP protocol error (malformed or truncated packet)
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// Login rejected for the given username
    #[error("password rejected for {0:?}")]
    Authentication(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listener or connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Unknown or closed SFTP handle
    #[error("Invalid file handle: {0}")]
    InvalidHandle(String),

    /// Operation not supported
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Durable telemetry write failed
    ///
    /// Raised when the activity log cannot be opened or appended. The server
    /// treats this as fatal.
    #[error("Telemetry write failed: {0}")]
    Telemetry(String),

    /// JSON/TOML (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if error is worth a security-level log line
    ///
    /// # Returns
    ///
    /// `true` for rejected logins and malformed client packets
    pub fn is_security_event(&self) -> bool {
        matches!(self, Error::Authentication(_) | Error::Protocol(_))
    }

    /// Get error code for SFTP STATUS message
    pub fn to_status_code(&self) -> u32 {
        use crate::protocol::StatusCode;

        match self {
            Error::Protocol(_) | Error::InvalidHandle(_) => StatusCode::BadMessage as u32,
            Error::NotSupported(_) => StatusCode::OpUnsupported as u32,
            Error::Authentication(_) => StatusCode::PermissionDenied as u32,
            Error::Connection(_) => StatusCode::ConnectionLost as u32,
            _ => StatusCode::Failure as u32,
        }
    }

    /// Get sanitized error message for the peer
    pub fn sanitized_message(&self) -> String {
        match self {
            Error::Authentication(_) => "Permission denied".to_string(),
            Error::Protocol(_) => "Bad message".to_string(),
            Error::InvalidHandle(_) => "Invalid handle".to_string(),
            Error::NotSupported(_) => "Operation unsupported".to_string(),
            // Local I/O and telemetry details must never reach the peer
            _ => "Failure".to_string(),
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Create invalid handle error
    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Error::InvalidHandle(context.into())
    }

    /// Create telemetry error
    pub fn telemetry(context: impl Into<String>) -> Self {
        Error::Telemetry(context.into())
    }
}

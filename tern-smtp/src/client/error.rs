//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors that can occur when using the SMTP client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// No response (or no connection) within the allowed time.
    #[error("Timed out after {0} seconds while {1}")]
    Timeout(u64, &'static str),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Whether the failure happened below the SMTP layer.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout(..) | Self::ConnectionClosed
        )
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

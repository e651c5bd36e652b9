//! Error types for the inbound side of tern-smtp.

use std::io;

use thiserror::Error;

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent more than the allowed number of bytes without a line
    /// terminator.
    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Specialized `Result` type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

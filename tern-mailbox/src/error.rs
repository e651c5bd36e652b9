//! Error types for the tern-mailbox crate.

use std::io;

use thiserror::Error;

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Every storage failure, regardless of backend.
///
/// Callers treat this as a failure of the one message or recipient they were
/// handling; nothing here is fatal to the process.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An underlying filesystem operation failed.
    #[error("Failed to {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    /// A persisted record could not be encoded or decoded.
    #[error("Failed to {operation}: {reason}")]
    Serialization { operation: String, reason: String },

    /// An address or folder name that cannot be mapped onto the filesystem.
    #[error("Invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("Folder {folder} does not exist for {address}")]
    FolderNotFound { address: String, folder: String },
}

/// Attach the failing operation to an I/O result.
pub(crate) trait IoContext<T> {
    fn during<F, S>(self, operation: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn during<F, S>(self, operation: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| StorageError::Io {
            operation: operation().into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::*;

    #[test]
    fn io_errors_carry_operation_and_source() {
        let result: io::Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let err = result
            .during(|| "read index for user@example.com/INBOX")
            .unwrap_err();

        assert!(matches!(
            &err,
            StorageError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound
        ));
        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "Failed to read index for user@example.com/INBOX: gone"
        );
    }
}

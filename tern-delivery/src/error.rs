use tern_mailbox::StorageError;
use tern_smtp::client::ClientError;
use thiserror::Error;

/// Why one transfer to one exchanger failed.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: ClientError,
    },

    /// The exchanger answered a step with a code other than the one
    /// required to continue.
    #[error("Unexpected reply to {stage}: {code} {message}")]
    UnexpectedReply {
        stage: &'static str,
        code: u16,
        message: String,
    },

    #[error("No mail exchanger available for {0}")]
    NoExchanger(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl TransferError {
    /// Whether the exchanger itself refused with a 5xx reply.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::UnexpectedReply { code: 500..=599, .. })
    }
}

/// Why a delivery attempt for a task failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Message {0} not found in the relay store")]
    MessageNotFound(String),

    #[error("Unable to read message: {0}")]
    Storage(#[from] StorageError),

    /// Every exchanger for the recipient failed; carries the last error.
    #[error("Delivery to {recipient} failed: {source}")]
    Recipient {
        recipient: String,
        #[source]
        source: TransferError,
    },

    #[error("{failed} of {total} recipients failed, last error: {last}")]
    Partial {
        failed: usize,
        total: usize,
        last: Box<Self>,
    },
}

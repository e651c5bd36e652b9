//! Seams between the inbound and outbound halves of the server.

use std::sync::Arc;

/// Accepts relay work from an inbound session.
///
/// Implementors must return immediately; the transfer itself happens
/// elsewhere. `false` means the work was dropped (e.g. the queue is not
/// running) and the caller should log it.
pub trait RelayQueue: Send + Sync {
    fn enqueue(&self, message_id: &str, recipients: Vec<String>) -> bool;
}

impl<T: RelayQueue + ?Sized> RelayQueue for Arc<T> {
    fn enqueue(&self, message_id: &str, recipients: Vec<String>) -> bool {
        (**self).enqueue(message_id, recipients)
    }
}

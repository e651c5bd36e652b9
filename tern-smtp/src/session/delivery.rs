use ahash::AHashSet;
use tern_common::{internal, status::Status, tracing};
use tern_mailbox::{INBOX, Message};
use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;
use crate::dispatch::Reply;

/// Distinct entries of `items`, first occurrence wins, compared
/// case-insensitively.
fn distinct(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = AHashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.to_ascii_lowercase()))
        .collect()
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// Hand a completed body to local mailboxes and the relay queue.
    ///
    /// Every recipient is handled on its own; a failure for one is logged
    /// and does not affect the others or the reply. The transaction is
    /// cleared whatever the outcome.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip_all)]
    pub(super) async fn complete_data(&mut self) -> Reply {
        if self.context.body_overflow {
            internal!(level = WARN, "Rejected message over {} bytes", self.config.max_message_size);
            self.context.reset_transaction();
            return Reply::new(
                Status::ExceededStorage,
                "Message size exceeds fixed maximum message size",
            );
        }

        let sender = self.context.sender.take().unwrap_or_default();
        let recipients = std::mem::take(&mut self.context.recipients);
        let body = std::mem::take(&mut self.context.body);
        self.context.reset_transaction();

        let (local, remote): (Vec<String>, Vec<String>) = distinct(recipients)
            .into_iter()
            .partition(|rcpt| self.config.local_domains.is_local_address(rcpt));

        let mut message = Message::new(sender.clone(), local.clone(), body);

        for rcpt in &local {
            match self
                .backends
                .mailboxes
                .save_message(rcpt, INBOX, &message)
                .await
            {
                Ok(id) => {
                    internal!(level = INFO, "Delivered {id} from {sender} to {rcpt}");
                    message.assign_id(id);
                }
                Err(err) => {
                    internal!(level = ERROR, "Failed to deliver to {rcpt}: {err}");
                }
            }
        }

        if !remote.is_empty() {
            self.relay(message, remote).await;
        }

        Reply::new(Status::Ok, "OK Message accepted for delivery")
    }

    async fn relay(&self, message: Message, remote: Vec<String>) {
        let mut outbound = Message::new(
            message.from().to_string(),
            remote.clone(),
            message.content(),
        )
        .with_received_at(message.received_at());
        if let Some(id) = message.id() {
            outbound.assign_id(id);
        }

        match self.backends.relay_store.store(&outbound).await {
            Ok(id) => {
                if self.backends.relay.enqueue(&id, remote.clone()) {
                    internal!(level = INFO, "Queued {id} for relay to {}", remote.join(", "));
                } else {
                    internal!(
                        level = WARN,
                        "Relay queue refused {id} for {}",
                        remote.join(", ")
                    );
                }
            }
            Err(err) => {
                internal!(
                    level = ERROR,
                    "Failed to store message for relay to {}: {err}",
                    remote.join(", ")
                );
            }
        }
    }
}

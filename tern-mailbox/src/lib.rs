//! Durable, folder-organised message storage.
//!
//! [`MailboxStorage`] keeps one mailbox per local address with a set of
//! folders, each folder backed by a directory of message bodies and a single
//! delimited `index` file that is authoritative for which messages exist.
//! [`store::MessageStore`] is the flat, id-keyed store the delivery engine
//! reads relay bodies back from.

pub mod error;
mod fs;
pub mod id;
pub mod mailbox;
pub mod message;
pub mod metadata;
pub mod storage;
pub mod store;

pub use error::{Result, StorageError};
pub use mailbox::{INBOX, Mailbox, PROTECTED_FOLDERS};
pub use message::Message;
pub use metadata::MessageMetadata;
pub use storage::MailboxStorage;
pub use store::{FileMessageStore, MemoryMessageStore, MessageStore, StorageStats};

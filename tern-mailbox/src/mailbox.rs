use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const INBOX: &str = "INBOX";

/// Folders every mailbox is created with and that can never be removed.
pub const PROTECTED_FOLDERS: [&str; 4] = [INBOX, "Sent", "Drafts", "Trash"];

#[must_use]
pub fn is_protected(folder: &str) -> bool {
    PROTECTED_FOLDERS.contains(&folder)
}

/// One local recipient's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub folders: BTreeSet<String>,
}

impl Mailbox {
    /// A fresh mailbox holding only the protected folders.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            created_at: Utc::now(),
            folders: PROTECTED_FOLDERS.iter().map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn has_folder(&self, folder: &str) -> bool {
        self.folders.contains(folder)
    }
}

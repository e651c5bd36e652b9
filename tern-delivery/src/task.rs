use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a task is in its lifecycle.
///
/// ```text
/// Queued -> InProgress -> Delivered
///                      -> Failed -> Retry -> Queued
///                                -> (retries spent) evicted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Queued,
    InProgress,
    Delivered,
    Failed,
    Retry,
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::InProgress => "in progress",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Retry => "retry",
        })
    }
}

/// Retry state for one relayed message and the recipients still owed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub message_id: String,
    /// Recipients not yet delivered to.
    pub recipients: Vec<String>,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl DeliveryTask {
    #[must_use]
    pub fn new(message_id: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            message_id: message_id.into(),
            recipients,
            status: DeliveryStatus::Queued,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            last_attempt: None,
        }
    }

    /// Add recipients not already pending, ignoring case.
    pub fn merge_recipients(&mut self, recipients: impl IntoIterator<Item = String>) {
        for recipient in recipients {
            if !self
                .recipients
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(&recipient))
            {
                self.recipients.push(recipient);
            }
        }
    }

    pub fn begin_attempt(&mut self) {
        self.status = DeliveryStatus::InProgress;
        self.last_attempt = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Display) {
        self.status = DeliveryStatus::Failed;
        self.last_error = Some(error.to_string());
    }

    /// Whether the retry budget is spent.
    #[must_use]
    pub const fn exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use mailparse::MailHeaderMap;

pub const NO_SUBJECT: &str = "(no subject)";

/// An accepted message: immutable envelope and content plus mutable flags.
///
/// The size is always derived from the content, and the id can be assigned
/// once and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: Option<String>,
    from: String,
    recipients: Vec<String>,
    raw_content: Arc<[u8]>,
    received_at: DateTime<Utc>,
    flags: BTreeSet<String>,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        recipients: Vec<String>,
        raw_content: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            id: None,
            from: from.into(),
            recipients,
            raw_content: raw_content.into(),
            received_at: Utc::now(),
            flags: BTreeSet::new(),
        }
    }

    /// Rebuild a persisted message.
    pub(crate) fn restore(
        id: String,
        from: String,
        recipients: Vec<String>,
        raw_content: Arc<[u8]>,
        received_at: DateTime<Utc>,
        flags: BTreeSet<String>,
    ) -> Self {
        Self {
            id: Some(id),
            from,
            recipients,
            raw_content,
            received_at,
            flags,
        }
    }

    #[must_use]
    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    #[must_use]
    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Assign the id if none has been assigned yet. Returns whether it took.
    pub fn assign_id(&mut self, id: impl Into<String>) -> bool {
        if self.id.is_some() {
            return false;
        }
        self.id = Some(id.into());
        true
    }

    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    #[must_use]
    pub fn raw_content(&self) -> &[u8] {
        &self.raw_content
    }

    /// Shared handle to the content without copying it.
    #[must_use]
    pub fn content(&self) -> Arc<[u8]> {
        Arc::clone(&self.raw_content)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.raw_content.len()
    }

    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    #[must_use]
    pub const fn flags(&self) -> &BTreeSet<String> {
        &self.flags
    }

    /// The first `Subject` header, or `(no subject)`.
    #[must_use]
    pub fn subject(&self) -> String {
        mailparse::parse_headers(&self.raw_content)
            .ok()
            .and_then(|(headers, _)| headers.get_first_value("Subject"))
            .map(|subject| subject.trim().to_string())
            .filter(|subject| !subject.is_empty())
            .unwrap_or_else(|| NO_SUBJECT.to_string())
    }
}

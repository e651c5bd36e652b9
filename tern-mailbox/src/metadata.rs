//! Folder index records and their on-disk line format.
//!
//! An index file holds one record per line:
//!
//! ```text
//! # Message Index
//! # Format: messageId|from|subject|receivedTime|size|flags
//! MSG20240101120000123|a@example.com|Hello|2024-01-01T12:00:00.123Z|512|\Seen,\Flagged
//! ```
//!
//! `|` is reserved, so it is stripped from every field along with line
//! breaks. Lines starting with `#`, blank lines and lines with fewer than five
//! fields are ignored.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use tern_common::internal;

use crate::message::Message;

const DELIMITER: char = '|';
const FLAG_SEPARATOR: char = ',';
const HEADER: &str = "# Message Index\n# Format: messageId|from|subject|receivedTime|size|flags\n";

/// The per-message record kept in a folder index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub size: usize,
    pub flags: BTreeSet<String>,
}

impl MessageMetadata {
    #[must_use]
    pub fn for_message(id: &str, message: &Message) -> Self {
        Self {
            id: id.to_string(),
            from: message.from().to_string(),
            subject: message.subject(),
            received_at: message.received_at(),
            size: message.size(),
            flags: message.flags().clone(),
        }
    }

    fn to_line(&self) -> String {
        let flags = self
            .flags
            .iter()
            .map(|flag| sanitise(flag).replace(FLAG_SEPARATOR, ""))
            .filter(|flag| !flag.is_empty())
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "{}|{}|{}|{}|{}|{}",
            sanitise(&self.id),
            sanitise(&self.from),
            sanitise(&self.subject),
            self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.size,
            flags
        )
    }

    fn from_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.splitn(6, DELIMITER).collect();
        if parts.len() < 5 {
            return None;
        }

        let received_at = DateTime::parse_from_rfc3339(parts[3])
            .ok()?
            .with_timezone(&Utc);
        let size = parts[4].trim().parse().ok()?;
        let flags = parts
            .get(5)
            .map(|flags| {
                flags
                    .split(FLAG_SEPARATOR)
                    .map(str::trim)
                    .filter(|flag| !flag.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            id: parts[0].to_string(),
            from: parts[1].to_string(),
            subject: parts[2].to_string(),
            received_at,
            size,
            flags,
        })
    }
}

fn sanitise(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '|' | '\r' | '\n'))
        .collect()
}

/// Render a whole index file.
#[must_use]
pub fn encode_index(entries: &[MessageMetadata]) -> String {
    let mut out = String::from(HEADER);
    for entry in entries {
        out.push_str(&entry.to_line());
        out.push('\n');
    }
    out
}

/// Parse an index file, skipping comments and malformed lines.
#[must_use]
pub fn decode_index(contents: &str) -> Vec<MessageMetadata> {
    contents
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let parsed = MessageMetadata::from_line(line);
            if parsed.is_none() {
                internal!(level = WARN, "Skipping malformed index line: {line:?}");
            }
            parsed
        })
        .collect()
}

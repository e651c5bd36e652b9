//! Id-keyed storage for relay message bodies.
//!
//! Unlike [`crate::MailboxStorage`] there are no mailboxes or folders here:
//! one body per message id, kept until the delivery engine is finished with
//! it. The file backend partitions by receive date:
//!
//! ```text
//! <root>/<yyyy>/<mm>/<id>.eml    raw content
//! <root>/<yyyy>/<mm>/<id>.meta   envelope (RON)
//! ```

use std::{
    collections::BTreeSet,
    fmt::Debug,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tern_common::internal;

use crate::{
    error::{IoContext, Result, StorageError},
    fs::{is_safe_component, read_optional, remove_optional, write_atomic},
    id::MessageIdGenerator,
    message::Message,
};

/// Point-in-time view of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_messages: usize,
    pub total_size: u64,
    pub healthy: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync + Debug {
    /// Persist a message, assigning an id if it has none, and return the id.
    /// Storing an id that already exists replaces it.
    async fn store(&self, message: &Message) -> Result<String>;

    async fn fetch(&self, id: &str) -> Result<Option<Message>>;

    /// Returns whether anything was removed.
    async fn remove(&self, id: &str) -> Result<bool>;

    /// Ids of every stored message, in no particular order.
    async fn ids(&self) -> Result<Vec<String>>;

    async fn stats(&self) -> Result<StorageStats>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: String,
    from: String,
    recipients: Vec<String>,
    received_at: DateTime<Utc>,
    size: usize,
    #[serde(default)]
    flags: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Located {
    dir: PathBuf,
    size: usize,
}

/// File-backed [`MessageStore`].
///
/// Writes go to `.tmp_` files and are renamed into place, data before
/// envelope, so a listed envelope always has its data next to it.
#[derive(Debug)]
pub struct FileMessageStore {
    root: PathBuf,
    ids: MessageIdGenerator,
    located: DashMap<String, Located>,
}

impl FileMessageStore {
    /// Open a store, creating the root if needed and indexing what is
    /// already on disk.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        internal!("Initialising message store at {} ...", root.display());

        tokio::fs::create_dir_all(&root)
            .await
            .during(|| format!("create message store {}", root.display()))?;

        let store = Self {
            root,
            ids: MessageIdGenerator::default(),
            located: DashMap::new(),
        };
        store.load_existing().await?;

        Ok(store)
    }

    async fn load_existing(&self) -> Result<()> {
        for year in subdirectories(&self.root).await? {
            for month in subdirectories(&year).await? {
                let mut entries = tokio::fs::read_dir(&month)
                    .await
                    .during(|| format!("scan {}", month.display()))?;

                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .during(|| format!("scan {}", month.display()))?
                {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with(".tmp_") {
                        continue;
                    }
                    let Some(id) = name.strip_suffix(".meta") else {
                        continue;
                    };

                    match read_envelope(&entry.path()).await {
                        Ok(Some(envelope)) if envelope.id == id => {
                            self.located.insert(
                                envelope.id,
                                Located {
                                    dir: month.clone(),
                                    size: envelope.size,
                                },
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            internal!(level = WARN, "Skipping unreadable envelope {name}: {err}");
                        }
                    }
                }
            }
        }

        internal!(
            level = INFO,
            "Found {} stored messages in {}",
            self.located.len(),
            self.root.display()
        );

        Ok(())
    }

    fn partition(&self, received_at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(format!("{:04}", received_at.year()))
            .join(format!("{:02}", received_at.month()))
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    #[tracing::instrument(level = "debug", skip(self, message), fields(size = message.size()))]
    async fn store(&self, message: &Message) -> Result<String> {
        let id = match message.id() {
            Some(id) => id.to_string(),
            None => self.ids.generate(),
        };
        if !is_safe_component(&id) {
            return Err(StorageError::InvalidName {
                kind: "message id",
                name: id,
            });
        }

        let dir = self.partition(message.received_at());
        tokio::fs::create_dir_all(&dir)
            .await
            .during(|| format!("create {}", dir.display()))?;

        let envelope = Envelope {
            id: id.clone(),
            from: message.from().to_string(),
            recipients: message.recipients().to_vec(),
            received_at: message.received_at(),
            size: message.size(),
            flags: message.flags().clone(),
        };
        let encoded = ron::ser::to_string(&envelope).map_err(|err| StorageError::Serialization {
            operation: format!("encode envelope for {id}"),
            reason: err.to_string(),
        })?;

        write_atomic(&dir.join(format!("{id}.eml")), message.raw_content(), "message data").await?;
        write_atomic(&dir.join(format!("{id}.meta")), encoded.as_bytes(), "envelope").await?;

        self.located.insert(
            id.clone(),
            Located {
                dir,
                size: message.size(),
            },
        );

        internal!(level = DEBUG, "Stored message {id}");

        Ok(id)
    }

    async fn fetch(&self, id: &str) -> Result<Option<Message>> {
        let Some(located) = self.located.get(id).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };

        let Some(envelope) = read_envelope(&located.dir.join(format!("{id}.meta"))).await? else {
            return Ok(None);
        };
        let Some(data) = read_optional(&located.dir.join(format!("{id}.eml")), "message data").await?
        else {
            return Ok(None);
        };

        Ok(Some(Message::restore(
            envelope.id,
            envelope.from,
            envelope.recipients,
            Arc::from(data),
            envelope.received_at,
            envelope.flags,
        )))
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let Some((_, located)) = self.located.remove(id) else {
            return Ok(false);
        };

        // Envelope first: without it the data file is never listed again
        remove_optional(&located.dir.join(format!("{id}.meta")), "envelope").await?;
        remove_optional(&located.dir.join(format!("{id}.eml")), "message data").await?;

        internal!(level = DEBUG, "Removed stored message {id}");

        Ok(true)
    }

    async fn ids(&self) -> Result<Vec<String>> {
        Ok(self.located.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn stats(&self) -> Result<StorageStats> {
        let healthy = tokio::fs::metadata(&self.root)
            .await
            .is_ok_and(|meta| meta.is_dir());

        Ok(StorageStats {
            total_messages: self.located.len(),
            total_size: self
                .located
                .iter()
                .map(|entry| entry.value().size as u64)
                .sum(),
            healthy,
        })
    }
}

/// In-memory [`MessageStore`], for tests and throwaway deployments.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    ids: MessageIdGenerator,
    messages: DashMap<String, Message>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store(&self, message: &Message) -> Result<String> {
        let mut stored = message.clone();
        if stored.id().is_none() {
            stored.assign_id(self.ids.generate());
        }
        let id = stored.id().map(ToString::to_string).unwrap_or_default();
        self.messages.insert(id.clone(), stored);
        Ok(id)
    }

    async fn fetch(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.messages.get(id).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.messages.remove(id).is_some())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        Ok(self.messages.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_messages: self.messages.len(),
            total_size: self
                .messages
                .iter()
                .map(|entry| entry.value().size() as u64)
                .sum(),
            healthy: true,
        })
    }
}

async fn subdirectories(path: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .during(|| format!("scan {}", path.display()))?;
    let mut dirs = Vec::new();

    while let Some(entry) = entries
        .next_entry()
        .await
        .during(|| format!("scan {}", path.display()))?
    {
        let is_dir = entry.file_type().await.is_ok_and(|kind| kind.is_dir());
        if is_dir {
            dirs.push(entry.path());
        }
    }

    dirs.sort();
    Ok(dirs)
}

async fn read_envelope(path: &Path) -> Result<Option<Envelope>> {
    let Some(bytes) = read_optional(path, "envelope").await? else {
        return Ok(None);
    };

    ron::de::from_bytes(&bytes)
        .map(Some)
        .map_err(|err| StorageError::Serialization {
            operation: format!("decode envelope {}", path.display()),
            reason: err.to_string(),
        })
}

//! The mailbox storage engine.
//!
//! On disk a storage root looks like:
//!
//! ```text
//! <root>/<address>/.mailbox.ron          mailbox record (created time, folders)
//! <root>/<address>/<folder>/index        folder index, see [`crate::metadata`]
//! <root>/<address>/<folder>/<id>.eml     message bodies
//! ```
//!
//! Each (address, folder) index sits behind its own reader/writer lock with
//! a write-through cache. Readers share the lock and work from the cached
//! copy; a cache miss takes the write lock to load it. Every mutation holds
//! the write lock across read, persist and recache, so changes to one folder
//! are totally ordered while other folders proceed in parallel.
//!
//! Lock order is index lock, then mailbox lock. Nothing takes them the other
//! way round.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use tern_common::internal;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};

use crate::{
    error::{IoContext, Result, StorageError},
    fs::{is_safe_component, read_optional, remove_optional, write_atomic},
    id::MessageIdGenerator,
    mailbox::{Mailbox, is_protected},
    message::Message,
    metadata::{MessageMetadata, decode_index, encode_index},
};

const MAILBOX_FILE: &str = ".mailbox.ron";
const INDEX_FILE: &str = "index";
const BODY_EXTENSION: &str = "eml";
const MAX_ID_ATTEMPTS: usize = 8;

type FolderKey = (String, String);
type IndexSlot = Arc<RwLock<Option<Vec<MessageMetadata>>>>;
type IndexReadGuard = OwnedRwLockReadGuard<Option<Vec<MessageMetadata>>>;

#[derive(Debug)]
pub struct MailboxStorage {
    root: PathBuf,
    ids: MessageIdGenerator,
    mailboxes: DashMap<String, Arc<Mutex<Mailbox>>>,
    /// Serialises first-touch creation so a mailbox is created at most once.
    creation: Mutex<()>,
    indexes: DashMap<FolderKey, IndexSlot>,
}

impl MailboxStorage {
    /// Open (creating if needed) a storage root and load existing mailboxes.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_ids(root, MessageIdGenerator::default()).await
    }

    pub async fn open_with_ids(root: impl Into<PathBuf>, ids: MessageIdGenerator) -> Result<Self> {
        let root = root.into();
        internal!("Opening mailbox storage at {}", root.display());

        tokio::fs::create_dir_all(&root)
            .await
            .during(|| format!("create storage root {}", root.display()))?;

        let storage = Self {
            root,
            ids,
            mailboxes: DashMap::new(),
            creation: Mutex::new(()),
            indexes: DashMap::new(),
        };
        storage.load_existing().await?;

        Ok(storage)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn load_existing(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .during(|| format!("scan storage root {}", self.root.display()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .during(|| format!("scan storage root {}", self.root.display()))?
        {
            let path = entry.path().join(MAILBOX_FILE);
            match read_mailbox(&path).await {
                Ok(Some(mailbox)) => {
                    let key = entry.file_name().to_string_lossy().into_owned();
                    self.mailboxes.insert(key, Arc::new(Mutex::new(mailbox)));
                }
                Ok(None) => {}
                Err(err) => {
                    internal!(level = WARN, "Ignoring unreadable mailbox: {err}");
                }
            }
        }

        internal!(
            level = INFO,
            "Loaded {} mailboxes from {}",
            self.mailboxes.len(),
            self.root.display()
        );

        Ok(())
    }

    /// Return the mailbox for `address`, creating it with the default folders
    /// on first touch.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_or_create_mailbox(&self, address: &str) -> Result<Mailbox> {
        let key = mailbox_key(address)?;
        let mailbox = self.mailbox_handle(&key).await?;
        let snapshot = mailbox.lock().await.clone();
        Ok(snapshot)
    }

    async fn mailbox_handle(&self, key: &str) -> Result<Arc<Mutex<Mailbox>>> {
        if let Some(existing) = self.cached_mailbox(key) {
            return Ok(existing);
        }

        let _creating = self.creation.lock().await;
        if let Some(existing) = self.cached_mailbox(key) {
            return Ok(existing);
        }

        let dir = self.root.join(key);
        let mailbox = if let Some(mailbox) = read_mailbox(&dir.join(MAILBOX_FILE)).await? {
            mailbox
        } else {
            let mailbox = Mailbox::new(key);
            for folder in &mailbox.folders {
                create_dir(&dir.join(folder)).await?;
            }
            write_mailbox(&dir, &mailbox).await?;
            internal!(level = INFO, "Created mailbox for {key}");
            mailbox
        };

        let handle = Arc::new(Mutex::new(mailbox));
        self.mailboxes.insert(key.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    fn cached_mailbox(&self, key: &str) -> Option<Arc<Mutex<Mailbox>>> {
        self.mailboxes.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `key` has `folder`, without creating the mailbox. Every
    /// mailbox on disk is loaded at open, so the cache is authoritative.
    async fn folder_exists(&self, key: &str, folder: &str) -> bool {
        match self.cached_mailbox(key) {
            Some(mailbox) => mailbox.lock().await.has_folder(folder),
            None => false,
        }
    }

    /// The lock and cache for one folder index. Only call this for folders
    /// that exist (or are being created); entries are dropped again in
    /// [`Self::delete_folder`].
    fn index_slot(&self, key: &str, folder: &str) -> IndexSlot {
        let slot = self
            .indexes
            .entry((key.to_string(), folder.to_string()))
            .or_default();
        Arc::clone(slot.value())
    }

    fn is_current_slot(&self, key: &str, folder: &str, slot: &IndexSlot) -> bool {
        self.indexes
            .get(&(key.to_string(), folder.to_string()))
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    fn folder_dir(&self, key: &str, folder: &str) -> PathBuf {
        self.root.join(key).join(folder)
    }

    fn body_path(&self, key: &str, folder: &str, id: &str) -> PathBuf {
        self.folder_dir(key, folder)
            .join(format!("{id}.{BODY_EXTENSION}"))
    }

    async fn load_index(&self, key: &str, folder: &str) -> Result<Vec<MessageMetadata>> {
        let path = self.folder_dir(key, folder).join(INDEX_FILE);
        Ok(read_optional(&path, "index")
            .await?
            .map(|bytes| decode_index(&String::from_utf8_lossy(&bytes)))
            .unwrap_or_default())
    }

    async fn persist_index(
        &self,
        key: &str,
        folder: &str,
        entries: &[MessageMetadata],
    ) -> Result<()> {
        let dir = self.folder_dir(key, folder);
        create_dir(&dir).await?;
        write_atomic(&dir.join(INDEX_FILE), encode_index(entries).as_bytes(), "index").await
    }

    /// Make sure the slot holds a loaded index. Must be called with the
    /// slot's write lock held.
    async fn ensure_loaded<'a>(
        &self,
        guard: &'a mut Option<Vec<MessageMetadata>>,
        key: &str,
        folder: &str,
    ) -> Result<&'a mut Vec<MessageMetadata>> {
        if guard.is_none() {
            *guard = Some(self.load_index(key, folder).await?);
        }
        Ok(guard.get_or_insert_with(Vec::new))
    }

    /// Shared access to a folder index, loading it first on a cache miss.
    async fn read_index(&self, key: &str, folder: &str) -> Result<IndexReadGuard> {
        let slot = self.index_slot(key, folder);

        let guard = Arc::clone(&slot).read_owned().await;
        if guard.is_some() {
            return Ok(guard);
        }
        drop(guard);

        let mut guard = slot.write_owned().await;
        self.ensure_loaded(&mut guard, key, folder).await?;
        Ok(guard.downgrade())
    }

    /// Read bodies for the indexed messages, optionally just one id. Entries
    /// whose body has gone missing are skipped rather than surfaced.
    async fn hydrate(&self, key: &str, folder: &str, only: Option<&str>) -> Result<Vec<Message>> {
        let index = self.read_index(key, folder).await?;
        let entries = index.as_deref().unwrap_or_default();
        let mut messages = Vec::new();

        for entry in entries
            .iter()
            .filter(|entry| only.is_none_or(|id| entry.id == id))
        {
            let path = self.body_path(key, folder, &entry.id);
            let Some(body) = read_optional(&path, "message body").await? else {
                internal!(level = WARN, "Index lists {} but its body is missing", entry.id);
                continue;
            };

            messages.push(Message::restore(
                entry.id.clone(),
                entry.from.clone(),
                vec![key.to_string()],
                Arc::from(body),
                entry.received_at,
                entry.flags.clone(),
            ));
        }

        Ok(messages)
    }

    /// Persist `message` into `folder` and return its id.
    ///
    /// The body is written before the index entry, so a crash can leave an
    /// orphaned body but never an index entry without one. An id already
    /// present on the message is kept; saving the same id into the same
    /// folder twice is a no-op.
    #[tracing::instrument(level = "debug", skip(self, message), fields(size = message.size()))]
    pub async fn save_message(&self, address: &str, folder: &str, message: &Message) -> Result<String> {
        let key = mailbox_key(address)?;
        check_folder(folder)?;
        let mailbox = self.mailbox_handle(&key).await?;
        if !mailbox.lock().await.has_folder(folder) {
            return Err(StorageError::FolderNotFound {
                address: key,
                folder: folder.to_string(),
            });
        }

        let slot = self.index_slot(&key, folder);
        let mut guard = slot.write().await;

        // Deleted (and possibly recreated) while waiting for the index lock
        if !self.is_current_slot(&key, folder, &slot) || !mailbox.lock().await.has_folder(folder) {
            return Err(StorageError::FolderNotFound {
                address: key,
                folder: folder.to_string(),
            });
        }

        let entries = self.ensure_loaded(&mut guard, &key, folder).await?;

        let id = match message.id() {
            Some(id) => {
                check_id(id)?;
                if entries.iter().any(|entry| entry.id == id) {
                    return Ok(id.to_string());
                }
                id.to_string()
            }
            None => self.fresh_id(&key, folder).await?,
        };

        create_dir(&self.folder_dir(&key, folder)).await?;
        write_atomic(
            &self.body_path(&key, folder, &id),
            message.raw_content(),
            "message body",
        )
        .await?;

        let mut next = entries.clone();
        next.push(MessageMetadata::for_message(&id, message));
        self.persist_index(&key, folder, &next).await?;
        *entries = next;

        internal!(
            level = DEBUG,
            "Saved {id} ({} bytes) to {key}/{folder}",
            message.size()
        );

        Ok(id)
    }

    async fn fresh_id(&self, key: &str, folder: &str) -> Result<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.generate();
            let exists = tokio::fs::try_exists(self.body_path(key, folder, &id))
                .await
                .during(|| format!("check for existing message {id}"))?;
            if !exists {
                return Ok(id);
            }
            internal!(level = DEBUG, "Message id {id} already in use, regenerating");
        }

        Err(StorageError::Io {
            operation: format!("allocate a message id in {key}/{folder}"),
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "every generated id was already taken",
            ),
        })
    }

    /// All messages in a folder, in index order. A missing folder is empty.
    pub async fn get_messages(&self, address: &str, folder: &str) -> Result<Vec<Message>> {
        let key = mailbox_key(address)?;
        check_folder(folder)?;
        if !self.folder_exists(&key, folder).await {
            return Ok(Vec::new());
        }
        self.hydrate(&key, folder, None).await
    }

    pub async fn get_message(&self, address: &str, folder: &str, id: &str) -> Result<Option<Message>> {
        let key = mailbox_key(address)?;
        check_folder(folder)?;
        if !is_safe_component(id) || !self.folder_exists(&key, folder).await {
            return Ok(None);
        }

        let mut found = self.hydrate(&key, folder, Some(id)).await?;
        Ok(found.pop())
    }

    /// Remove a message. The index entry goes first, so a crash between the
    /// two steps only leaves an unreachable body behind.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_message(&self, address: &str, folder: &str, id: &str) -> Result<bool> {
        let key = mailbox_key(address)?;
        check_folder(folder)?;
        if !self.folder_exists(&key, folder).await {
            return Ok(false);
        }

        let slot = self.index_slot(&key, folder);
        let mut guard = slot.write().await;
        let entries = self.ensure_loaded(&mut guard, &key, folder).await?;

        let Some(position) = entries.iter().position(|entry| entry.id == id) else {
            return Ok(false);
        };

        let mut next = entries.clone();
        next.remove(position);
        self.persist_index(&key, folder, &next).await?;
        *entries = next;

        if let Err(err) = remove_optional(&self.body_path(&key, folder, id), "message body").await {
            internal!(level = WARN, "Index entry for {id} removed but body remains: {err}");
        }

        internal!(level = DEBUG, "Deleted {id} from {key}/{folder}");

        Ok(true)
    }

    /// Replace or extend a message's flags. Returns `false` if the message
    /// is not in the folder.
    #[tracing::instrument(level = "debug", skip(self, flags))]
    pub async fn update_flags<I, S>(
        &self,
        address: &str,
        folder: &str,
        id: &str,
        flags: I,
        replace: bool,
    ) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = mailbox_key(address)?;
        check_folder(folder)?;
        let flags: BTreeSet<String> = flags.into_iter().map(Into::into).collect();
        if !self.folder_exists(&key, folder).await {
            return Ok(false);
        }

        let slot = self.index_slot(&key, folder);
        let mut guard = slot.write().await;
        let entries = self.ensure_loaded(&mut guard, &key, folder).await?;

        let Some(position) = entries.iter().position(|entry| entry.id == id) else {
            return Ok(false);
        };

        let mut next = entries.clone();
        if replace {
            next[position].flags = flags;
        } else {
            next[position].flags.extend(flags);
        }
        self.persist_index(&key, folder, &next).await?;
        *entries = next;

        Ok(true)
    }

    /// Add a folder. Returns `false` if it already existed.
    pub async fn create_folder(&self, address: &str, folder: &str) -> Result<bool> {
        let key = mailbox_key(address)?;
        check_folder(folder)?;
        let handle = self.mailbox_handle(&key).await?;

        let slot = self.index_slot(&key, folder);
        let _index = slot.write().await;
        let mut mailbox = handle.lock().await;
        if mailbox.has_folder(folder) {
            return Ok(false);
        }

        create_dir(&self.folder_dir(&key, folder)).await?;

        let mut next = mailbox.clone();
        next.folders.insert(folder.to_string());
        write_mailbox(&self.root.join(&key), &next).await?;
        *mailbox = next;

        internal!(level = DEBUG, "Created folder {key}/{folder}");

        Ok(true)
    }

    /// Remove a folder and everything in it. Protected folders are left
    /// alone and report `false`, as do folders that do not exist.
    pub async fn delete_folder(&self, address: &str, folder: &str) -> Result<bool> {
        let key = mailbox_key(address)?;
        check_folder(folder)?;

        if is_protected(folder) {
            internal!(level = DEBUG, "Refusing to delete protected folder {key}/{folder}");
            return Ok(false);
        }

        let handle = self.mailbox_handle(&key).await?;
        if !handle.lock().await.has_folder(folder) {
            return Ok(false);
        }

        let slot = self.index_slot(&key, folder);
        let mut index = slot.write().await;
        let mut mailbox = handle.lock().await;
        if !mailbox.has_folder(folder) {
            return Ok(false);
        }

        let mut next = mailbox.clone();
        next.folders.remove(folder);
        write_mailbox(&self.root.join(&key), &next).await?;
        *mailbox = next;
        drop(mailbox);

        let dir = self.folder_dir(&key, folder);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                *index = None;
                return Err::<bool, _>(err).during(|| format!("remove folder {}", dir.display()));
            }
        }
        // Anyone still queued on this slot sees an empty folder
        *index = Some(Vec::new());
        drop(index);
        self.indexes
            .remove_if(&(key.clone(), folder.to_string()), |_, current| Arc::ptr_eq(current, &slot));

        internal!(level = DEBUG, "Deleted folder {key}/{folder}");

        Ok(true)
    }

    pub async fn list_folders(&self, address: &str) -> Result<Vec<String>> {
        let mailbox = self.get_or_create_mailbox(address).await?;
        Ok(mailbox.folders.into_iter().collect())
    }

    /// Number of messages listed in the folder index.
    pub async fn get_message_count(&self, address: &str, folder: &str) -> Result<usize> {
        let key = mailbox_key(address)?;
        check_folder(folder)?;
        if !self.folder_exists(&key, folder).await {
            return Ok(0);
        }
        let index = self.read_index(&key, folder).await?;
        Ok(index.as_ref().map_or(0, Vec::len))
    }
}

fn mailbox_key(address: &str) -> Result<String> {
    let key = address.trim().to_ascii_lowercase();
    if is_safe_component(&key) && !key.starts_with('.') {
        Ok(key)
    } else {
        Err(StorageError::InvalidName {
            kind: "address",
            name: address.to_string(),
        })
    }
}

fn check_folder(folder: &str) -> Result<()> {
    if is_safe_component(folder) && !folder.starts_with('.') && folder != INDEX_FILE {
        Ok(())
    } else {
        Err(StorageError::InvalidName {
            kind: "folder",
            name: folder.to_string(),
        })
    }
}

fn check_id(id: &str) -> Result<()> {
    if is_safe_component(id) {
        Ok(())
    } else {
        Err(StorageError::InvalidName {
            kind: "message id",
            name: id.to_string(),
        })
    }
}

async fn create_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .during(|| format!("create directory {}", path.display()))
}

async fn read_mailbox(path: &Path) -> Result<Option<Mailbox>> {
    let Some(bytes) = read_optional(path, "mailbox record").await? else {
        return Ok(None);
    };

    ron::de::from_bytes(&bytes)
        .map(Some)
        .map_err(|err| StorageError::Serialization {
            operation: format!("decode mailbox record {}", path.display()),
            reason: err.to_string(),
        })
}

async fn write_mailbox(dir: &Path, mailbox: &Mailbox) -> Result<()> {
    let encoded = ron::ser::to_string_pretty(mailbox, ron::ser::PrettyConfig::default())
        .map_err(|err| StorageError::Serialization {
            operation: format!("encode mailbox record for {}", mailbox.address),
            reason: err.to_string(),
        })?;

    create_dir(dir).await?;
    write_atomic(&dir.join(MAILBOX_FILE), encoded.as_bytes(), "mailbox record").await
}

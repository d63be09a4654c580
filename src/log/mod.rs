//! The oplog: an append-only, hash-linked DAG of signed [`Entry`]s.
//!
//! Entries reference their predecessors by [`Cid`] only and live in an entry [`Storage`]; the
//! log keeps the current frontier ([`Log::heads`]) and the set of validated hashes (the index)
//! in two further stores. Local appends and remote joins are serialized through two
//! independent FIFO locks.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::{
    access::{AccessController, AccessError},
    cid::Cid,
    identities::{Identities, Identity},
    storage::{MemoryStorage, Storage, StorageError},
};

mod clock;
mod conflict;
mod entry;
mod heads;

pub use self::{
    clock::Clock,
    conflict::{SortFn, last_write_wins},
    entry::{ENTRY_VERSION, Entry, EntryError},
    heads::find_heads,
};
use self::{conflict::sort_entries, heads::Heads};

/// Data that can be appended to a [`Log`].
pub trait Payload: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// The operation name and key this payload writes, for per-key access control.
    fn operation(&self) -> Option<(&str, Option<&str>)> {
        None
    }
}

impl Payload for String {}
impl Payload for Vec<u8> {}

/// Errors from log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The writer is not allowed to append to this log.
    #[error("could not append entry: key {0} is not allowed to write to the log")]
    AccessDenied(Cid),
    #[error("entry's id ({entry}) doesn't match the log's id ({log})")]
    IdMismatch { entry: String, log: String },
    #[error("could not validate signature for entry {0}")]
    InvalidSignature(Cid),
    /// The clock of an entry names another key than the one that signed it.
    #[error("clock of entry {0} does not belong to its signing key")]
    ClockMismatch(Cid),
    /// An ancestor of a joined entry could not be fetched.
    #[error("entry {0} is referenced but could not be found")]
    MissingEntry(Cid),
    /// The sort function returned equal for two distinct entries.
    #[error("sort function cannot order distinct entries {0} and {1}")]
    AmbiguousOrder(Cid, Cid),
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Options for [`Log::open`].
pub struct LogOptions<T> {
    /// Log id, defaults to the current time in milliseconds.
    pub id: Option<String>,
    pub access: AccessController,
    pub entry_storage: Option<Arc<dyn Storage>>,
    pub heads_storage: Option<Arc<dyn Storage>>,
    pub index_storage: Option<Arc<dyn Storage>>,
    /// Heads to start from.
    pub heads: Vec<Entry<T>>,
    /// Entry order, defaults to [`last_write_wins`].
    pub sort: Option<SortFn<T>>,
}

impl<T> Default for LogOptions<T> {
    fn default() -> Self {
        Self {
            id: None,
            access: AccessController::AllowAll,
            entry_storage: None,
            heads_storage: None,
            index_storage: None,
            heads: Vec::new(),
            sort: None,
        }
    }
}

/// Bounds for [`Log::iter`].
///
/// `lt`/`lte` pick where iteration starts (default: the heads), `gt`/`gte` where it ends.
#[derive(Debug, Clone, Default)]
pub struct LogIterOptions {
    /// Maximum number of entries, unlimited when `None`.
    pub amount: Option<usize>,
    pub gt: Option<Cid>,
    pub gte: Option<Cid>,
    pub lt: Option<Cid>,
    pub lte: Option<Cid>,
}

/// Marker stored in the index for validated hashes.
const INDEXED: Bytes = Bytes::from_static(&[1]);

/// An oplog.
#[derive(Debug)]
pub struct Log<T: Payload> {
    inner: Arc<Inner<T>>,
}

impl<T: Payload> Clone for Log<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(derive_more::Debug)]
struct Inner<T: Payload> {
    id: String,
    identity: Identity,
    identities: Identities,
    access: AccessController,
    entries: Arc<dyn Storage>,
    index: Arc<dyn Storage>,
    heads: Heads<T>,
    #[debug(skip)]
    sort: SortFn<T>,
    #[debug(skip)]
    append_lock: Mutex<()>,
    #[debug(skip)]
    join_lock: Mutex<()>,
}

fn default_log_id() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
}

impl<T: Payload> Log<T> {
    /// Opens a log that appends as `identity` and verifies remote entries with `identities`.
    pub async fn open(identity: Identity, identities: Identities, options: LogOptions<T>) -> Result<Self, LogError> {
        let LogOptions {
            id,
            access,
            entry_storage,
            heads_storage,
            index_storage,
            heads,
            sort,
        } = options;
        let memory = || Arc::new(MemoryStorage::new()) as Arc<dyn Storage>;
        let heads_store = Heads::new(heads_storage.unwrap_or_else(memory));
        if !heads.is_empty() {
            heads_store.set(&heads).await?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                id: id.unwrap_or_else(default_log_id),
                identity,
                identities,
                access,
                entries: entry_storage.unwrap_or_else(memory),
                index: index_storage.unwrap_or_else(memory),
                heads: heads_store,
                sort: sort.unwrap_or_else(|| Arc::new(last_write_wins::<T>)),
                append_lock: Mutex::new(()),
                join_lock: Mutex::new(()),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn access(&self) -> &AccessController {
        &self.inner.access
    }

    /// The entry store.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.entries
    }

    /// Current heads, newest first.
    pub async fn heads(&self) -> Result<Vec<Entry<T>>, LogError> {
        let mut heads = self.inner.heads.all().await?;
        sort_entries(&self.inner.sort, &mut heads)?;
        heads.reverse();
        Ok(heads)
    }

    /// Clock of the latest head, owned by the local identity.
    pub async fn clock(&self) -> Result<Clock, LogError> {
        let time = self
            .inner
            .heads
            .all()
            .await?
            .iter()
            .map(|e| e.clock().time)
            .max()
            .unwrap_or(0);
        Ok(Clock::new(self.inner.identity.public_key(), time))
    }

    pub async fn get(&self, hash: &Cid) -> Result<Option<Entry<T>>, LogError> {
        let Some(bytes) = self.inner.entries.get(&hash.to_string()).await? else {
            return Ok(None);
        };
        Ok(Some(Entry::decode(bytes)?))
    }

    /// Whether `hash` has been validated into this log.
    pub async fn has(&self, hash: &Cid) -> Result<bool, LogError> {
        Ok(self.inner.index.get(&hash.to_string()).await?.is_some())
    }

    /// Appends `payload` as a new entry superseding all current heads.
    ///
    /// Up to `references_count` older ancestors are sampled into the entry's `refs`.
    pub async fn append(&self, payload: T, references_count: usize) -> Result<Entry<T>, LogError> {
        let _guard = self.inner.append_lock.lock().await;
        let heads = self.heads().await?;
        let next: Vec<Cid> = heads.iter().map(|e| e.hash()).collect();
        let refs = self.references(&heads, references_count + heads.len()).await?;
        let clock = self.clock().await?.tick();
        let entry = Entry::create(&self.inner.identity, &self.inner.id, payload, clock, next, refs)?;

        if !self.inner.access.can_append(&entry).await? {
            return Err(LogError::AccessDenied(self.inner.identity.hash()));
        }

        let key = entry.hash().to_string();
        self.inner.entries.put(&key, entry.bytes().clone()).await?;
        self.inner.index.put(&key, INDEXED).await?;
        self.inner.heads.set(std::slice::from_ref(&entry)).await?;
        trace!(log = %self.inner.id, hash = %entry.hash(), time = entry.clock().time, "appended");
        Ok(entry)
    }

    /// Samples ancestor hashes for a new entry on top of `heads`.
    ///
    /// Walks `amount` entries back from the heads without following refs, then keeps the
    /// ones past the heads and their first ancestor.
    async fn references(&self, heads: &[Entry<T>], amount: usize) -> Result<Vec<Cid>, LogError> {
        let mut refs = Vec::new();
        if heads.is_empty() {
            return Ok(refs);
        }
        let mut walk = self.traverse(Some(heads.to_vec()), false).await?;
        while let Some(entry) = walk.next().await? {
            refs.push(entry.hash());
            if refs.len() >= amount {
                break;
            }
        }
        let skip = heads.len() + 1;
        Ok(refs
            .into_iter()
            .skip(skip)
            .take(amount.saturating_sub(skip))
            .collect())
    }

    /// Walks the DAG from `roots` (default: the heads), newest first.
    ///
    /// Dropping the [`Traversal`] stops the walk; entries are only expanded once the caller
    /// asks for the next one.
    pub async fn traverse(&self, roots: Option<Vec<Entry<T>>>, use_refs: bool) -> Result<Traversal<T>, LogError> {
        let stack = match roots {
            Some(roots) => roots,
            None => self.heads().await?,
        };
        Ok(Traversal {
            log: self.clone(),
            stack,
            fetched: HashSet::new(),
            traversed: HashSet::new(),
            last: None,
            use_refs,
        })
    }

    /// All entries, oldest first.
    pub async fn values(&self) -> Result<Vec<Entry<T>>, LogError> {
        let mut values = Vec::new();
        let mut walk = self.traverse(None, true).await?;
        while let Some(entry) = walk.next().await? {
            values.push(entry);
        }
        values.reverse();
        Ok(values)
    }

    /// Alias of [`Self::values`].
    pub async fn all(&self) -> Result<Vec<Entry<T>>, LogError> {
        self.values().await
    }

    /// Entries within the bounds of `opts`, newest first.
    ///
    /// With an end bound (`gt`/`gte`) and an `amount` but no start bound, the `amount` entries
    /// closest to the end bound are returned.
    pub async fn iter(&self, opts: LogIterOptions) -> Result<Vec<Entry<T>>, LogError> {
        let LogIterOptions {
            amount,
            gt,
            gte,
            lt,
            lte,
        } = opts;
        if amount == Some(0) {
            return Ok(Vec::new());
        }
        let start = self.start_entries(lt.as_ref(), lte.as_ref()).await?;
        let end = match gt.or(gte) {
            Some(hash) => self.get(&hash).await?,
            None => None,
        };
        let end_hash = end.as_ref().map(|e| e.hash());
        let limit = if end.is_some() { None } else { amount };
        let buffered = end.is_some() && lt.is_none() && lte.is_none();
        let buffer_size = if buffered { amount } else { None };

        let mut out = Vec::new();
        let mut tail = VecDeque::new();
        let mut count = 0;
        let mut walk = self.traverse(Some(start), true).await?;
        while let Some(entry) = walk.next().await? {
            count += 1;
            let at_end = end_hash == Some(entry.hash());
            let skip = at_end && gt.is_some();
            if !skip {
                match buffer_size {
                    Some(size) => {
                        tail.push_back(entry);
                        if tail.len() > size {
                            tail.pop_front();
                        }
                    }
                    None => out.push(entry),
                }
            }
            if at_end || limit.is_some_and(|limit| count >= limit) {
                break;
            }
        }
        if buffer_size.is_some() {
            out.extend(tail);
        } else if let (Some(_), Some(amount)) = (end_hash, amount) {
            out.truncate(amount);
        }
        Ok(out)
    }

    async fn start_entries(&self, lt: Option<&Cid>, lte: Option<&Cid>) -> Result<Vec<Entry<T>>, LogError> {
        if let Some(lte) = lte {
            return Ok(self.get(lte).await?.into_iter().collect());
        }
        if let Some(lt) = lt {
            let mut start = Vec::new();
            if let Some(entry) = self.get(lt).await? {
                for hash in entry.next() {
                    if let Some(next) = self.get(hash).await? {
                        start.push(next);
                    }
                }
            }
            return Ok(start);
        }
        self.heads().await
    }

    /// Verifies and merges a remote `entry` and all of its missing ancestors.
    ///
    /// Returns `false` if the entry was already part of the log.
    pub async fn join_entry(&self, entry: Entry<T>) -> Result<bool, LogError> {
        let _guard = self.inner.join_lock.lock().await;
        if self.has(&entry.hash()).await? {
            return Ok(false);
        }
        self.verify_entry(&entry).await?;

        let heads: HashSet<Cid> = self.heads().await?.iter().map(|e| e.hash()).collect();
        let mut to_add = vec![entry.clone()];
        let mut added: HashSet<Cid> = HashSet::from([entry.hash()]);
        let mut connected = HashSet::new();
        let mut to_get: Vec<Cid> = Vec::new();
        for hash in entry.links(true) {
            self.classify_link(hash, &heads, &added, &mut to_get, &mut connected)
                .await?;
        }
        while let Some(hash) = to_get.pop() {
            if added.contains(&hash) {
                continue;
            }
            let ancestor = self.get(&hash).await?.ok_or(LogError::MissingEntry(hash))?;
            self.verify_entry(&ancestor).await?;
            added.insert(hash);
            for link in ancestor.links(true) {
                self.classify_link(link, &heads, &added, &mut to_get, &mut connected)
                    .await?;
            }
            to_add.push(ancestor);
        }

        for entry in &to_add {
            let key = entry.hash().to_string();
            self.inner.entries.put(&key, entry.bytes().clone()).await?;
            self.inner.index.put(&key, INDEXED).await?;
        }
        for hash in &connected {
            self.inner.heads.remove(hash).await?;
        }
        self.inner.heads.add(entry.clone()).await?;
        debug!(log = %self.inner.id, hash = %entry.hash(), added = to_add.len(), "joined entry");
        Ok(true)
    }

    async fn classify_link(
        &self,
        hash: &Cid,
        heads: &HashSet<Cid>,
        added: &HashSet<Cid>,
        to_get: &mut Vec<Cid>,
        connected: &mut HashSet<Cid>,
    ) -> Result<(), LogError> {
        if self.has(hash).await? {
            if heads.contains(hash) {
                connected.insert(*hash);
            }
        } else if !added.contains(hash) {
            to_get.push(*hash);
        }
        Ok(())
    }

    async fn verify_entry(&self, entry: &Entry<T>) -> Result<(), LogError> {
        if entry.id() != self.inner.id {
            return Err(LogError::IdMismatch {
                entry: entry.id().to_string(),
                log: self.inner.id.clone(),
            });
        }
        if entry.clock().id != entry.key() {
            return Err(LogError::ClockMismatch(entry.hash()));
        }
        if !self.inner.access.can_append(entry).await? {
            return Err(LogError::AccessDenied(entry.identity()));
        }
        if !entry.verify(&self.inner.identities)? {
            return Err(LogError::InvalidSignature(entry.hash()));
        }
        Ok(())
    }

    /// Merges `other` into this log: absorbs its entry store, then joins each of its heads.
    pub async fn join(&self, other: &Log<T>) -> Result<(), LogError> {
        self.inner.entries.merge(other.storage().as_ref()).await?;
        for head in other.heads().await? {
            self.join_entry(head).await?;
        }
        Ok(())
    }

    /// Removes every entry, head and index record.
    pub async fn clear(&self) -> Result<(), LogError> {
        self.inner.index.clear().await?;
        self.inner.heads.clear().await?;
        self.inner.entries.clear().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), LogError> {
        self.inner.index.close().await?;
        self.inner.heads.close().await?;
        self.inner.entries.close().await?;
        Ok(())
    }
}

/// A newest-first walk over a [`Log`], see [`Log::traverse`].
#[derive(derive_more::Debug)]
pub struct Traversal<T: Payload> {
    #[debug(skip)]
    log: Log<T>,
    stack: Vec<Entry<T>>,
    fetched: HashSet<Cid>,
    traversed: HashSet<Cid>,
    last: Option<Entry<T>>,
    use_refs: bool,
}

impl<T: Payload> Traversal<T> {
    /// Yields the next entry, or `None` once the reachable DAG is exhausted.
    pub async fn next(&mut self) -> Result<Option<Entry<T>>, LogError> {
        if let Some(last) = self.last.take() {
            for hash in last.links(self.use_refs) {
                if self.traversed.contains(hash) || !self.fetched.insert(*hash) {
                    continue;
                }
                if let Some(entry) = self.log.get(hash).await? {
                    self.stack.push(entry);
                }
            }
        }
        sort_entries(&self.log.inner.sort, &mut self.stack)?;
        while let Some(entry) = self.stack.pop() {
            if self.traversed.insert(entry.hash()) {
                self.fetched.insert(entry.hash());
                self.last = Some(entry.clone());
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

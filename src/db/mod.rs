//! Databases: materialized views over a replicated [`Log`] of [`Operation`]s.
//!
//! A [`Database`] owns the log, its storage and a [`SyncEngine`]. The views in the submodules
//! ([`Events`], [`KeyValue`], [`Documents`], [`KeyValueIndexed`]) wrap it and replay the log to
//! answer queries.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use futures_util::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    access::{AccessController, AccessError},
    address::Address,
    cid::Cid,
    config::Config,
    identities::{Identities, Identity},
    log::{Entry, EntryError, Log, LogError, LogOptions, Payload},
    net::{Node, PeerId},
    storage::{ComposedStorage, ContentStorage, LruStorage, PersistentStorage, Storage, StorageError},
    sync::{HeadsSource, SyncEngine, SyncEvent},
};

pub mod documents;
pub mod events;
pub mod keyvalue;
pub mod keyvalue_indexed;

pub use self::{
    documents::{DEFAULT_INDEX_BY, Documents},
    events::{EventEntry, Events},
    keyvalue::KeyValue,
    keyvalue_indexed::KeyValueIndexed,
};

const EVENTS_CAP: usize = 256;
const SYNC_EVENTS_CAP: usize = 64;

/// Values a database can hold.
pub trait Value: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Value for T where T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

/// Kind of a database operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum Op {
    #[display("PUT")]
    Put,
    #[display("DEL")]
    Del,
    #[display("ADD")]
    Add,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Put => "PUT",
            Op::Del => "DEL",
            Op::Add => "ADD",
        }
    }
}

/// The payload of every database entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation<T> {
    pub op: Op,
    pub key: Option<String>,
    pub value: Option<T>,
}

impl<T> Operation<T> {
    pub fn put(key: impl Into<String>, value: T) -> Self {
        Self {
            op: Op::Put,
            key: Some(key.into()),
            value: Some(value),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self {
            op: Op::Del,
            key: Some(key.into()),
            value: None,
        }
    }

    pub fn add(value: T) -> Self {
        Self {
            op: Op::Add,
            key: None,
            value: Some(value),
        }
    }
}

impl<T: Value> Payload for Operation<T> {
    fn operation(&self) -> Option<(&str, Option<&str>)> {
        Some((self.op.as_str(), self.key.as_deref()))
    }
}

/// An entry of a database log.
pub type DbEntry<T> = Entry<Operation<T>>;

/// A live key and its value, as listed by the key-value views.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValueEntry<T> {
    pub key: String,
    pub value: T,
    /// Hash of the entry that wrote the value.
    pub hash: Cid,
}

/// The database view types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum DbKind {
    #[display("events")]
    Events,
    #[display("keyvalue")]
    KeyValue,
    #[display("documents")]
    Documents,
    #[display("keyvalue-indexed")]
    KeyValueIndexed,
}

impl FromStr for DbKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "events" => Ok(DbKind::Events),
            "keyvalue" => Ok(DbKind::KeyValue),
            "documents" => Ok(DbKind::Documents),
            "keyvalue-indexed" => Ok(DbKind::KeyValueIndexed),
            _ => Err(DbError::UnsupportedKind(s.to_string())),
        }
    }
}

/// Errors from database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database type {0:?} is not supported")]
    UnsupportedKind(String),
    #[error("database is closed")]
    Closed,
    #[error("no document with key {0:?} in database")]
    NotFound(String),
    #[error("document is missing the index field {0:?}")]
    MissingIndex(String),
    #[error("failed to start sync: {0:#}")]
    Sync(anyhow::Error),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("failed to encode value: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("failed to inspect document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Notifications from a [`Database`].
#[derive(Debug, Clone)]
pub enum DatabaseEvent<T> {
    /// An entry was appended locally or merged from a peer.
    Update(DbEntry<T>),
    /// Heads were exchanged with a peer. Carries our heads after the exchange.
    Join { peer: PeerId, heads: Vec<DbEntry<T>> },
    Leave(PeerId),
    Close,
    Drop,
    /// A peer driven failure, the database keeps running.
    Error(String),
}

/// Runs after every entry that changed the log, before the update is announced.
pub type UpdateHook<T> =
    Arc<dyn Fn(Log<Operation<T>>, DbEntry<T>) -> BoxFuture<'static, Result<(), DbError>> + Send + Sync>;

type CloseHook = Box<dyn FnOnce() + Send>;

/// Everything needed to open a [`Database`].
#[derive(derive_more::Debug)]
pub struct DatabaseOptions<T: Value> {
    pub node: Node,
    pub identity: Identity,
    pub identities: Identities,
    pub address: Address,
    pub name: String,
    pub kind: DbKind,
    pub meta: Option<String>,
    pub access: AccessController,
    pub config: Config,
    /// Overrides the entry store, by default an LRU in front of the block store.
    pub entry_storage: Option<Arc<dyn Storage>>,
    pub heads_storage: Option<Arc<dyn Storage>>,
    pub index_storage: Option<Arc<dyn Storage>>,
    #[debug(skip)]
    pub on_update: Option<UpdateHook<T>>,
}

impl<T: Value> DatabaseOptions<T> {
    pub fn new(node: Node, identity: Identity, identities: Identities, address: Address, access: AccessController) -> Self {
        Self {
            node,
            identity,
            identities,
            name: address.to_string(),
            address,
            kind: DbKind::Events,
            meta: None,
            access,
            config: Config::default(),
            entry_storage: None,
            heads_storage: None,
            index_storage: None,
            on_update: None,
        }
    }
}

/// Opens the ordered store at `<directory>/<address>/<path>`, or an in-memory one.
pub(crate) fn persistent_storage(
    directory: Option<&Path>,
    address: &Address,
    path: &str,
    cache_size: usize,
) -> Result<Arc<dyn Storage>, StorageError> {
    let backing = match directory {
        Some(dir) => PersistentStorage::persistent(database_dir(dir, address).join(path))?,
        None => PersistentStorage::in_memory()?,
    };
    Ok(Arc::new(ComposedStorage::new(
        Arc::new(LruStorage::with_capacity(cache_size)),
        Arc::new(backing),
    )))
}

fn database_dir(directory: &Path, address: &Address) -> PathBuf {
    directory.join(address.cid().to_string())
}

/// A database: a log, its storage and its replication.
#[derive(Debug)]
pub struct Database<T: Value> {
    inner: Arc<Inner<T>>,
}

impl<T: Value> Clone for Database<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(derive_more::Debug)]
struct Inner<T: Value> {
    address: Address,
    name: String,
    kind: DbKind,
    meta: Option<String>,
    log: Log<Operation<T>>,
    access: AccessController,
    sync: SyncEngine,
    references_count: usize,
    events: broadcast::Sender<DatabaseEvent<T>>,
    #[debug(skip)]
    queue: Mutex<()>,
    #[debug(skip)]
    on_update: Option<UpdateHook<T>>,
    #[debug(skip)]
    close_hooks: parking_lot::Mutex<Vec<CloseHook>>,
    #[debug(skip)]
    apply_task: parking_lot::Mutex<Option<AbortOnDropHandle<()>>>,
    closed: AtomicBool,
}

impl<T: Value> Database<T> {
    /// Opens the log of `options.address` and starts syncing it unless disabled.
    pub async fn open(options: DatabaseOptions<T>) -> Result<Self, DbError> {
        let DatabaseOptions {
            node,
            identity,
            identities,
            address,
            name,
            kind,
            meta,
            access,
            config,
            entry_storage,
            heads_storage,
            index_storage,
            on_update,
        } = options;
        let directory = config.directory.as_deref();
        let entry_storage = match entry_storage {
            Some(storage) => storage,
            None => Arc::new(ComposedStorage::new(
                Arc::new(LruStorage::with_capacity(config.cache_size)),
                Arc::new(
                    ContentStorage::new(node.blocks.clone())
                        .pin(config.pin_blocks)
                        .timeout(config.block_timeout()),
                ),
            )),
        };
        let heads_storage = match heads_storage {
            Some(storage) => storage,
            None => persistent_storage(directory, &address, "log/_heads", config.cache_size)?,
        };
        let index_storage = match index_storage {
            Some(storage) => storage,
            None => persistent_storage(directory, &address, "log/_index", config.cache_size)?,
        };

        let log = Log::open(
            identity,
            identities,
            LogOptions {
                id: Some(address.to_string()),
                access: access.clone(),
                entry_storage: Some(entry_storage),
                heads_storage: Some(heads_storage),
                index_storage: Some(index_storage),
                ..Default::default()
            },
        )
        .await?;

        let heads: HeadsSource = {
            let log = log.clone();
            Arc::new(move || {
                let log = log.clone();
                async move {
                    let heads = log.heads().await?;
                    Ok(heads.iter().map(|e| e.bytes().clone()).collect())
                }
                .boxed()
            })
        };
        let (sync_tx, sync_rx) = mpsc::channel(SYNC_EVENTS_CAP);
        let sync = SyncEngine::new(node.clone(), address.to_string(), heads, sync_tx, config.sync_timeout());
        let (events, _) = broadcast::channel(EVENTS_CAP);

        let db = Self {
            inner: Arc::new(Inner {
                address,
                name,
                kind,
                meta,
                log,
                access,
                sync,
                references_count: config.references_count,
                events,
                queue: Mutex::new(()),
                on_update,
                close_hooks: Default::default(),
                apply_task: Default::default(),
                closed: AtomicBool::new(false),
            }),
        };
        let span = error_span!("db", me = %node.id.fmt_short(), address = %db.inner.address);
        let task = tokio::spawn(apply_sync_events(Arc::downgrade(&db.inner), sync_rx).instrument(span));
        *db.inner.apply_task.lock() = Some(AbortOnDropHandle::new(task));

        if config.sync_automatically {
            db.inner.sync.start().await.map_err(DbError::Sync)?;
        }
        debug!(address = %db.inner.address, kind = %db.inner.kind, "opened database");
        Ok(db)
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> DbKind {
        self.inner.kind
    }

    pub fn meta(&self) -> Option<&str> {
        self.inner.meta.as_deref()
    }

    pub fn identity(&self) -> &Identity {
        self.inner.log.identity()
    }

    pub fn log(&self) -> &Log<Operation<T>> {
        &self.inner.log
    }

    pub fn access(&self) -> &AccessController {
        &self.inner.access
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.inner.sync
    }

    /// Peers this database is currently syncing with.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.sync.peers()
    }

    /// Subscribes to the database events.
    pub fn events(&self) -> broadcast::Receiver<DatabaseEvent<T>> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Registers `hook` to run once the database is closed.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        self.inner.close_hooks.lock().push(Box::new(hook));
    }

    /// Appends `op`, publishes it to the connected peers and announces it.
    pub async fn add_operation(&self, op: Operation<T>) -> Result<Cid, DbError> {
        let _guard = self.inner.queue.lock().await;
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        let entry = self.inner.log.append(op, self.inner.references_count).await?;
        if let Err(err) = self.inner.sync.add(entry.bytes().clone()).await {
            warn!(?err, "failed to publish entry");
            self.emit(DatabaseEvent::Error(format!("{err:#}")));
        }
        self.run_update_hook(&entry).await?;
        let hash = entry.hash();
        self.emit(DatabaseEvent::Update(entry));
        Ok(hash)
    }

    /// Stops syncing and closes the log and the access controller.
    pub async fn close(&self) -> Result<(), DbError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.inner.sync.stop().await {
            warn!(?err, "failed to stop sync");
        }
        let _guard = self.inner.queue.lock().await;
        self.inner.apply_task.lock().take();
        self.inner.log.close().await?;
        self.inner.access.close().await?;
        self.emit(DatabaseEvent::Close);
        let hooks = std::mem::take(&mut *self.inner.close_hooks.lock());
        for hook in hooks {
            hook();
        }
        debug!(address = %self.inner.address, "closed database");
        Ok(())
    }

    /// Removes every entry of the log, and the grants of a capability access controller.
    pub async fn drop(&self) -> Result<(), DbError> {
        let _guard = self.inner.queue.lock().await;
        self.inner.log.clear().await?;
        self.inner.access.drop().await?;
        self.emit(DatabaseEvent::Drop);
        Ok(())
    }

    fn emit(&self, event: DatabaseEvent<T>) {
        // nobody listening is fine
        self.inner.events.send(event).ok();
    }

    async fn run_update_hook(&self, entry: &DbEntry<T>) -> Result<(), DbError> {
        if let Some(hook) = &self.inner.on_update {
            hook(self.inner.log.clone(), entry.clone()).await?;
        }
        Ok(())
    }

    async fn on_sync_event(&self, event: SyncEvent) -> Result<(), DbError> {
        match event {
            SyncEvent::Entry { bytes, .. } => self.apply_entry(bytes).await?,
            SyncEvent::Joined(peer) => {
                let heads = self.inner.log.heads().await?;
                self.emit(DatabaseEvent::Join { peer, heads });
            }
            SyncEvent::Left(peer) => self.emit(DatabaseEvent::Leave(peer)),
            SyncEvent::Error(err) => self.emit(DatabaseEvent::Error(err)),
        }
        Ok(())
    }

    async fn apply_entry(&self, bytes: Bytes) -> Result<(), DbError> {
        let entry = DbEntry::<T>::decode(bytes)?;
        let _guard = self.inner.queue.lock().await;
        if self.inner.log.join_entry(entry.clone()).await? {
            self.run_update_hook(&entry).await?;
            self.emit(DatabaseEvent::Update(entry));
        }
        Ok(())
    }
}

/// Applies what sync receives, one event at a time.
async fn apply_sync_events<T: Value>(db: Weak<Inner<T>>, mut events: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = db.upgrade() else {
            break;
        };
        let db = Database { inner };
        if let Err(err) = db.on_sync_event(event).await {
            warn!(?err, "failed to apply synced entry");
            db.emit(DatabaseEvent::Error(err.to_string()));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests;

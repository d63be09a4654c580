//! The [`OrbitDb`] façade: opens databases by name or address.
//!
//! Opening a name creates an access controller and a [`Manifest`], whose hash becomes the
//! database address. Opening an address reads the manifest back and rebuilds the database it
//! describes. Databases already open are returned again.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Weak},
};

use futures_util::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    access::{
        AccessController, AccessError, AccessKind, AccessOptions, CapabilityAccess, ResourceAccess,
        StaticAccess,
    },
    address::{Address, AddressError},
    config::Config,
    db::{
        DEFAULT_INDEX_BY, Database, DatabaseOptions, DbError, DbKind, Documents, Events, KeyValue,
        KeyValueIndexed, Value,
    },
    identities::{Identities, Identity, IdentityError},
    keystore::{KeyStore, KeyStoreError},
    manifest::{Manifest, ManifestError, ManifestStore},
    net::Node,
    storage::{ComposedStorage, ContentStorage, LruStorage, PersistentStorage, Storage, StorageError},
};

/// Errors from the [`OrbitDb`] façade.
#[derive(Debug, thiserror::Error)]
pub enum OrbitError {
    #[error("database {0} is already open with a different value type")]
    TypeMismatch(Address),
    #[error("database {address} is a {actual} database, expected {expected}")]
    KindMismatch {
        address: Address,
        expected: DbKind,
        actual: DbKind,
    },
    #[error("manifest of database {0} not found")]
    ManifestNotFound(Address),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// An open database of any type.
#[derive(Debug, Clone)]
pub enum Store<T: Value> {
    Events(Events<T>),
    KeyValue(KeyValue<T>),
    Documents(Documents<T>),
    KeyValueIndexed(KeyValueIndexed<T>),
}

impl<T: Value> Store<T> {
    pub fn database(&self) -> &Database<T> {
        match self {
            Store::Events(db) => db.database(),
            Store::KeyValue(db) => db.database(),
            Store::Documents(db) => db.database(),
            Store::KeyValueIndexed(db) => db.database(),
        }
    }

    pub fn kind(&self) -> DbKind {
        match self {
            Store::Events(_) => DbKind::Events,
            Store::KeyValue(_) => DbKind::KeyValue,
            Store::Documents(_) => DbKind::Documents,
            Store::KeyValueIndexed(_) => DbKind::KeyValueIndexed,
        }
    }

    pub fn address(&self) -> &Address {
        self.database().address()
    }

    pub async fn close(&self) -> Result<(), DbError> {
        match self {
            Store::KeyValueIndexed(db) => db.close().await,
            _ => self.database().close().await,
        }
    }

    fn kind_mismatch(&self, expected: DbKind) -> OrbitError {
        OrbitError::KindMismatch {
            address: *self.address(),
            expected,
            actual: self.kind(),
        }
    }
}

/// How to open a database.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Type of a new database. Ignored when opening an address, the manifest decides.
    pub kind: Option<DbKind>,
    /// Access controller of a new database.
    pub access: AccessOptions,
    pub meta: Option<String>,
    /// Overrides [`Config::sync_automatically`].
    pub sync_automatically: Option<bool>,
    /// Document field used as key by [`Documents`], `_id` by default.
    pub index_by: Option<String>,
    /// Writes with this identity instead of the node identity.
    pub identity: Option<Identity>,
}

impl OpenOptions {
    pub fn kind(mut self, kind: DbKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn access(mut self, access: AccessOptions) -> Self {
        self.access = access;
        self
    }

    pub fn meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    pub fn sync_automatically(mut self, sync: bool) -> Self {
        self.sync_automatically = Some(sync);
        self
    }

    pub fn index_by(mut self, field: impl Into<String>) -> Self {
        self.index_by = Some(field.into());
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// Options for [`OrbitDb::new`].
#[derive(Debug, Default)]
pub struct OrbitOptions {
    /// Id of the node identity, the node id by default.
    pub id: Option<String>,
    /// Identity service to use instead of one built from the config.
    pub identities: Option<Identities>,
    /// Identity to write with instead of creating one for `id`.
    pub identity: Option<Identity>,
    pub config: Config,
}

type CloseFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), DbError>> + Send + Sync>;

struct OpenDb {
    store: Box<dyn Any + Send + Sync>,
    close: CloseFn,
}

/// Opens and tracks the databases of one node.
#[derive(Debug, Clone)]
pub struct OrbitDb {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    node: Node,
    identity: Identity,
    identities: Identities,
    keystore: KeyStore,
    manifests: ManifestStore,
    /// Where static access controllers are stored.
    blocks: Arc<dyn Storage>,
    config: Config,
    #[debug(skip)]
    dbs: Mutex<HashMap<Address, OpenDb>>,
}

impl OrbitDb {
    pub async fn new(node: Node, options: OrbitOptions) -> Result<Self, OrbitError> {
        let OrbitOptions {
            id,
            identities,
            identity,
            config,
        } = options;
        let blocks: Arc<dyn Storage> = Arc::new(ComposedStorage::new(
            Arc::new(LruStorage::with_capacity(config.cache_size)),
            Arc::new(
                ContentStorage::new(node.blocks.clone())
                    .pin(config.pin_blocks)
                    .timeout(config.block_timeout()),
            ),
        ));
        let identities = match identities {
            Some(identities) => identities,
            None => {
                let keystore = match config.keystore_path() {
                    Some(path) => KeyStore::persistent(path, config.keystore_cache_size)?,
                    None => KeyStore::memory(),
                };
                let local: Arc<dyn Storage> = match config.identities_path() {
                    Some(path) => Arc::new(PersistentStorage::persistent(path)?),
                    None => Arc::new(LruStorage::with_capacity(config.identity_cache_size)),
                };
                // identities are fetched from the network when peers need them
                let storage = Arc::new(ComposedStorage::new(
                    local,
                    Arc::new(
                        ContentStorage::new(node.blocks.clone())
                            .pin(config.pin_blocks)
                            .timeout(config.block_timeout()),
                    ),
                ));
                Identities::with_providers(keystore, storage, Default::default(), config.identity_cache_size)
            }
        };
        let identity = match identity {
            Some(identity) => identity,
            None => {
                let id = id.unwrap_or_else(|| node.id.to_string());
                identities.create_identity(&id, None).await?
            }
        };
        info!(node = %node.id.fmt_short(), identity = identity.id(), "orbit started");
        Ok(Self {
            inner: Arc::new(Inner {
                keystore: identities.keystore().clone(),
                manifests: ManifestStore::new(blocks.clone()),
                node,
                identity,
                identities,
                blocks,
                config,
                dbs: Default::default(),
            }),
        })
    }

    /// The identity databases are written with.
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// The id of [`Self::identity`].
    pub fn id(&self) -> &str {
        self.inner.identity.id()
    }

    pub fn identities(&self) -> &Identities {
        &self.inner.identities
    }

    pub fn node(&self) -> &Node {
        &self.inner.node
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Addresses of the open databases.
    pub fn open_databases(&self) -> Vec<Address> {
        self.inner.dbs.lock().keys().copied().collect()
    }

    /// Opens the database at `name_or_address`, creating it when a name is given.
    pub async fn open_with<T: Value>(&self, name_or_address: &str, options: OpenOptions) -> Result<Store<T>, OrbitError> {
        if let Ok(address) = Address::parse(name_or_address) {
            if let Some(store) = self.cached::<T>(&address)? {
                return Ok(store);
            }
            let manifest = self
                .inner
                .manifests
                .get(&address)
                .await?
                .ok_or(OrbitError::ManifestNotFound(address))?;
            let kind: DbKind = manifest.kind.parse()?;
            let access = self.open_access(manifest.access_controller.clone()).await?;
            return self.instantiate(address, manifest, kind, access, options).await;
        }

        let name = name_or_address;
        let kind = options.kind.unwrap_or(DbKind::Events);
        let access = self.create_access(name.to_string(), options.access.clone()).await?;
        let (address, manifest) = self
            .inner
            .manifests
            .create(name, &kind.to_string(), &access.address(), options.meta.clone())
            .await?;
        if let Some(store) = self.cached::<T>(&address)? {
            return Ok(store);
        }
        self.instantiate(address, manifest, kind, access, options).await
    }

    /// Opens an [`Events`] database.
    pub async fn events<T: Value>(&self, name_or_address: &str) -> Result<Events<T>, OrbitError> {
        match self.open_with(name_or_address, OpenOptions::default().kind(DbKind::Events)).await? {
            Store::Events(db) => Ok(db),
            other => Err(other.kind_mismatch(DbKind::Events)),
        }
    }

    /// Opens a [`KeyValue`] database.
    pub async fn keyvalue<T: Value>(&self, name_or_address: &str) -> Result<KeyValue<T>, OrbitError> {
        match self.open_with(name_or_address, OpenOptions::default().kind(DbKind::KeyValue)).await? {
            Store::KeyValue(db) => Ok(db),
            other => Err(other.kind_mismatch(DbKind::KeyValue)),
        }
    }

    /// Opens a [`Documents`] database keyed by `_id`.
    pub async fn documents<T: Value>(&self, name_or_address: &str) -> Result<Documents<T>, OrbitError> {
        match self.open_with(name_or_address, OpenOptions::default().kind(DbKind::Documents)).await? {
            Store::Documents(db) => Ok(db),
            other => Err(other.kind_mismatch(DbKind::Documents)),
        }
    }

    /// Opens a [`KeyValueIndexed`] database.
    pub async fn keyvalue_indexed<T: Value>(&self, name_or_address: &str) -> Result<KeyValueIndexed<T>, OrbitError> {
        match self
            .open_with(name_or_address, OpenOptions::default().kind(DbKind::KeyValueIndexed))
            .await?
        {
            Store::KeyValueIndexed(db) => Ok(db),
            other => Err(other.kind_mismatch(DbKind::KeyValueIndexed)),
        }
    }

    /// Closes every open database and the keystore.
    pub async fn stop(&self) -> Result<(), OrbitError> {
        let open: Vec<_> = self.inner.dbs.lock().drain().collect();
        for (address, db) in open {
            if let Err(err) = (db.close)().await {
                warn!(%address, ?err, "failed to close database");
            }
        }
        self.inner.keystore.close().await?;
        self.inner.manifests.close().await?;
        info!(node = %self.inner.node.id.fmt_short(), "orbit stopped");
        Ok(())
    }

    fn cached<T: Value>(&self, address: &Address) -> Result<Option<Store<T>>, OrbitError> {
        let dbs = self.inner.dbs.lock();
        let Some(open) = dbs.get(address) else {
            return Ok(None);
        };
        match open.store.downcast_ref::<Store<T>>() {
            Some(store) => Ok(Some(store.clone())),
            None => Err(OrbitError::TypeMismatch(*address)),
        }
    }

    async fn instantiate<T: Value>(
        &self,
        address: Address,
        manifest: Manifest,
        kind: DbKind,
        access: AccessController,
        options: OpenOptions,
    ) -> Result<Store<T>, OrbitError> {
        let mut config = self.inner.config.clone();
        if let Some(sync) = options.sync_automatically {
            config.sync_automatically = sync;
        }
        let identity = options.identity.unwrap_or_else(|| self.inner.identity.clone());
        let mut db_options = DatabaseOptions::new(
            self.inner.node.clone(),
            identity,
            self.inner.identities.clone(),
            address,
            access,
        );
        db_options.name = manifest.name;
        db_options.kind = kind;
        db_options.meta = manifest.meta;
        db_options.config = config;

        let store = match kind {
            DbKind::Events => Store::Events(Events::new(Database::open(db_options).await?)),
            DbKind::KeyValue => Store::KeyValue(KeyValue::new(Database::open(db_options).await?)),
            DbKind::Documents => {
                let index_by = options.index_by.unwrap_or_else(|| DEFAULT_INDEX_BY.to_string());
                Store::Documents(Documents::new(Database::open(db_options).await?, index_by))
            }
            DbKind::KeyValueIndexed => Store::KeyValueIndexed(KeyValueIndexed::open(db_options).await?),
        };
        self.register(store).await
    }

    /// Tracks `store` until it is closed. If another open of the same address won the race, that
    /// one is returned and `store` is closed.
    async fn register<T: Value>(&self, store: Store<T>) -> Result<Store<T>, OrbitError> {
        let address = *store.address();
        let existing = {
            let mut dbs = self.inner.dbs.lock();
            match dbs.get(&address) {
                Some(open) => Some(open.store.downcast_ref::<Store<T>>().cloned()),
                None => {
                    let closing = store.clone();
                    dbs.insert(
                        address,
                        OpenDb {
                            store: Box::new(store.clone()),
                            close: Box::new(move || {
                                let closing = closing.clone();
                                async move { closing.close().await }.boxed()
                            }),
                        },
                    );
                    None
                }
            }
        };
        match existing {
            Some(Some(winner)) => {
                store.close().await?;
                Ok(winner)
            }
            Some(None) => {
                store.close().await?;
                Err(OrbitError::TypeMismatch(address))
            }
            None => {
                let registry = Arc::downgrade(&self.inner);
                store.database().on_close(move || deregister(&registry, &address));
                debug!(%address, kind = %store.kind(), "opened database");
                Ok(store)
            }
        }
    }

    /// Builds the access controller of a new database named `name`.
    fn create_access(&self, name: String, options: AccessOptions) -> BoxFuture<'_, Result<AccessController, OrbitError>> {
        async move {
            let write = options.write.unwrap_or_else(|| vec![self.id().to_string()]);
            let access = match options.kind {
                AccessKind::Static => AccessController::Static(
                    StaticAccess::create(&*self.inner.blocks, self.inner.identities.clone(), write).await?,
                ),
                AccessKind::Capability => {
                    let db = self.access_database(&format!("{name}/_access"), write).await?;
                    AccessController::Capability(CapabilityAccess::new(self.inner.identities.clone(), db))
                }
                AccessKind::Resource => {
                    let db = self.access_database(&format!("{name}/_acl"), write).await?;
                    AccessController::Resource(ResourceAccess::new(self.inner.identities.clone(), db))
                }
            };
            Ok(access)
        }
        .boxed()
    }

    /// Rebuilds the access controller stored at `address`.
    fn open_access(&self, address: String) -> BoxFuture<'_, Result<AccessController, OrbitError>> {
        async move {
            let access = match AccessKind::from_address(&address)? {
                AccessKind::Static => AccessController::Static(
                    StaticAccess::open(&*self.inner.blocks, self.inner.identities.clone(), &address).await?,
                ),
                AccessKind::Capability => {
                    let db = self.access_database(&address, Vec::new()).await?;
                    AccessController::Capability(CapabilityAccess::new(self.inner.identities.clone(), db))
                }
                AccessKind::Resource => {
                    let cid = address.rsplit('/').next().unwrap_or_default();
                    let db = self.access_database(&Address::parse(cid)?.to_string(), Vec::new()).await?;
                    AccessController::Resource(ResourceAccess::new(self.inner.identities.clone(), db))
                }
            };
            Ok(access)
        }
        .boxed()
    }

    /// Opens the key-value database backing a dynamic access controller. Only `admins` may write
    /// to a new one.
    async fn access_database(&self, name_or_address: &str, admins: Vec<String>) -> Result<KeyValue<Vec<String>>, OrbitError> {
        let options = OpenOptions::default()
            .kind(DbKind::KeyValue)
            .access(AccessOptions::new(AccessKind::Static).write(admins));
        match self.open_with::<Vec<String>>(name_or_address, options).await? {
            Store::KeyValue(db) => Ok(db),
            other => Err(other.kind_mismatch(DbKind::KeyValue)),
        }
    }
}

fn deregister(registry: &Weak<Inner>, address: &Address) {
    if let Some(inner) = registry.upgrade() {
        inner.dbs.lock().remove(address);
    }
}

//! Identities: key backed, content addressed signer descriptions.
//!
//! [`Identities`] creates identities through a registered [`IdentityProvider`], persists them by
//! hash and verifies identities received from other peers.

use std::{num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    cid::Cid,
    keystore::{self, KeyStore, KeyStoreError},
    storage::{MemoryStorage, Storage, StorageError},
};

mod identity;
mod provider;

pub use self::{
    identity::{Identity, IdentitySignatures},
    provider::{IdentityProvider, IdentityProviders, PUBLICKEY_PROVIDER, PublicKeyProvider},
};

/// Default capacity of the verified identity cache.
pub const DEFAULT_IDENTITY_CACHE_SIZE: usize = 1000;

/// Errors from identity creation and lookup.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("{0}")]
    Invalid(&'static str),
    #[error("identity provider type {0:?} is not supported")]
    UnsupportedProvider(String),
    #[error("private signing key for {0:?} not found in keystore")]
    MissingKey(String),
    #[error("failed to encode identity: {0}")]
    Encoding(#[from] postcard::Error),
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Creates, stores and verifies [`Identity`]s.
#[derive(Debug, Clone)]
pub struct Identities {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    keystore: KeyStore,
    storage: Arc<dyn Storage>,
    #[debug(skip)]
    cache: Mutex<LruCache<String, Identity>>,
    providers: IdentityProviders,
}

impl Identities {
    /// Creates the service over `keystore`, storing identities in `storage`.
    pub fn new(keystore: KeyStore, storage: Arc<dyn Storage>) -> Self {
        Self::with_providers(keystore, storage, IdentityProviders::default(), DEFAULT_IDENTITY_CACHE_SIZE)
    }

    pub fn with_providers(
        keystore: KeyStore,
        storage: Arc<dyn Storage>,
        providers: IdentityProviders,
        cache_size: usize,
    ) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                keystore,
                storage,
                cache: Mutex::new(LruCache::new(cache_size)),
                providers,
            }),
        }
    }

    /// Identities kept in memory, with a fresh in-memory keystore.
    pub fn memory() -> Self {
        Self::new(KeyStore::memory(), Arc::new(MemoryStorage::new()))
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.inner.keystore
    }

    /// Creates an identity for `id` using the provider registered as `provider`
    /// (`publickey` when `None`) and persists it.
    pub async fn create_identity(&self, id: &str, provider: Option<&str>) -> Result<Identity, IdentityError> {
        if id.is_empty() {
            return Err(IdentityError::Invalid("identity id is required"));
        }
        let kind = provider.unwrap_or(PUBLICKEY_PROVIDER);
        let provider = self.inner.providers.get(kind, &self.inner.keystore)?;
        let identity_id = provider.get_id(id).await?;

        let key = self.inner.keystore.get_or_create_key(&identity_id).await?;
        let id_signature = keystore::sign_message(&key, identity_id.as_bytes());
        let public_key = keystore::public_key_hex(&key);
        let public_key_signature = provider
            .sign_identity(format!("{public_key}{id_signature}").as_bytes(), id)
            .await?;

        let signatures = IdentitySignatures {
            id: id_signature,
            public_key: public_key_signature,
        };
        let identity = Identity::new(identity_id, public_key, signatures, provider.kind())?.with_signing_key(key);
        self.inner
            .storage
            .put(&identity.hash().to_string(), identity.bytes().clone())
            .await?;
        debug!(id = identity.id(), hash = %identity.hash(), "created identity");
        Ok(identity)
    }

    /// Checks both proofs of `identity`. Identities that verified before are compared against
    /// the cached copy instead.
    pub fn verify_identity(&self, identity: &Identity) -> bool {
        let signatures = identity.signatures();
        if !self
            .inner
            .keystore
            .verify_message(&signatures.id, identity.public_key(), identity.id().as_bytes())
        {
            trace!(id = identity.id(), "identity id signature does not verify");
            return false;
        }
        if let Some(cached) = self.inner.cache.lock().get(identity.id()) {
            return cached == identity;
        }
        let verified = identity.verify_provider_signature();
        if verified {
            self.inner
                .cache
                .lock()
                .put(identity.id().to_string(), identity.clone());
        }
        verified
    }

    /// Loads a stored identity by hash.
    pub async fn get_identity(&self, hash: &Cid) -> Result<Option<Identity>, IdentityError> {
        let Some(bytes) = self.inner.storage.get(&hash.to_string()).await? else {
            return Ok(None);
        };
        Ok(Some(Identity::decode(&bytes)?))
    }

    /// Signs `data` with the keystore key named after `identity`.
    pub async fn sign(&self, identity: &Identity, data: &[u8]) -> Result<String, IdentityError> {
        let key = self
            .inner
            .keystore
            .get_key(identity.id())
            .await?
            .ok_or_else(|| IdentityError::MissingKey(identity.id().to_string()))?;
        Ok(keystore::sign_message(&key, data))
    }

    /// Verifies a hex signature over `data` by the hex `public_key`.
    pub fn verify(&self, signature: &str, public_key: &str, data: &[u8]) -> bool {
        self.inner.keystore.verify_message(signature, public_key, data)
    }
}

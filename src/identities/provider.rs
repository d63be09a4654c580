use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;

use super::IdentityError;
use crate::keystore::{self, KeyStore};

/// Type string of the built-in [`PublicKeyProvider`].
pub const PUBLICKEY_PROVIDER: &str = "publickey";

/// Derives identity ids and signs identity proofs.
#[async_trait]
pub trait IdentityProvider: fmt::Debug + Send + Sync {
    /// The provider type recorded in identities it creates.
    fn kind(&self) -> &str;

    /// Resolves the identity id for the user supplied `id`.
    async fn get_id(&self, id: &str) -> Result<String, IdentityError>;

    /// Signs `data` on behalf of `id`.
    async fn sign_identity(&self, data: &[u8], id: &str) -> Result<String, IdentityError>;
}

/// Provider whose identity ids are the hex public keys of keystore keys.
#[derive(Debug, Clone)]
pub struct PublicKeyProvider {
    keystore: KeyStore,
}

impl PublicKeyProvider {
    pub fn new(keystore: KeyStore) -> Self {
        Self { keystore }
    }
}

#[async_trait]
impl IdentityProvider for PublicKeyProvider {
    fn kind(&self) -> &str {
        PUBLICKEY_PROVIDER
    }

    async fn get_id(&self, id: &str) -> Result<String, IdentityError> {
        if id.is_empty() {
            return Err(IdentityError::Invalid("id is required"));
        }
        let key = self.keystore.get_or_create_key(id).await?;
        Ok(keystore::public_key_hex(&key))
    }

    async fn sign_identity(&self, data: &[u8], id: &str) -> Result<String, IdentityError> {
        let key = self
            .keystore
            .get_key(id)
            .await?
            .ok_or_else(|| IdentityError::MissingKey(id.to_string()))?;
        Ok(keystore::sign_message(&key, data))
    }
}

type ProviderFactory = Arc<dyn Fn(&KeyStore) -> Arc<dyn IdentityProvider> + Send + Sync>;

/// String keyed registry of identity provider factories.
///
/// The `publickey` provider is always registered.
#[derive(Clone)]
pub struct IdentityProviders {
    factories: BTreeMap<String, ProviderFactory>,
}

impl fmt::Debug for IdentityProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl Default for IdentityProviders {
    fn default() -> Self {
        let mut providers = Self {
            factories: BTreeMap::new(),
        };
        providers.register(PUBLICKEY_PROVIDER, |keystore| {
            Arc::new(PublicKeyProvider::new(keystore.clone()))
        });
        providers
    }
}

impl IdentityProviders {
    /// Registers a provider factory under `kind`, replacing any previous one.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(&KeyStore) -> Arc<dyn IdentityProvider> + Send + Sync + 'static,
    ) {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn is_supported(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Instantiates the provider registered as `kind`.
    pub fn get(&self, kind: &str, keystore: &KeyStore) -> Result<Arc<dyn IdentityProvider>, IdentityError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| IdentityError::UnsupportedProvider(kind.to_string()))?;
        Ok(factory(keystore))
    }
}

//! Named signing keys.

use std::{num::NonZeroUsize, path::Path, sync::Arc};

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::storage::{ComposedStorage, LruStorage, MemoryStorage, PersistentStorage, Storage, StorageError};

/// Capacity of the verified signature cache.
const VERIFIED_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(1000).unwrap();

/// Errors from the [`KeyStore`].
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key id must not be empty")]
    EmptyId,
    #[error("stored key for {0:?} is malformed")]
    MalformedKey(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Stores ed25519 signing keys by name.
///
/// Keys live under `private_<id>` in the backing [`Storage`].
#[derive(derive_more::Debug, Clone)]
pub struct KeyStore {
    storage: Arc<dyn Storage>,
    #[debug(skip)]
    verified: Arc<Mutex<LruCache<String, (String, Bytes)>>>,
}

impl KeyStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            verified: Arc::new(Mutex::new(LruCache::new(VERIFIED_CACHE_SIZE))),
        }
    }

    /// A keystore that forgets its keys when dropped.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// A keystore persisted at `path` with an LRU of `cache_size` keys in front.
    pub fn persistent(path: impl AsRef<Path>, cache_size: usize) -> Result<Self, KeyStoreError> {
        let storage = ComposedStorage::new(
            Arc::new(LruStorage::with_capacity(cache_size)),
            Arc::new(PersistentStorage::persistent(path)?),
        );
        Ok(Self::new(Arc::new(storage)))
    }

    fn storage_key(id: &str) -> Result<String, KeyStoreError> {
        if id.is_empty() {
            return Err(KeyStoreError::EmptyId);
        }
        Ok(format!("private_{id}"))
    }

    /// Generates and stores a fresh key for `id`.
    pub async fn create_key(&self, id: &str) -> Result<SigningKey, KeyStoreError> {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        self.add_key(id, &key).await?;
        trace!(id, "created key");
        Ok(key)
    }

    /// Stores `key` under `id`, replacing any existing key.
    pub async fn add_key(&self, id: &str, key: &SigningKey) -> Result<(), KeyStoreError> {
        let storage_key = Self::storage_key(id)?;
        self.storage
            .put(&storage_key, Bytes::copy_from_slice(&key.to_bytes()))
            .await?;
        Ok(())
    }

    pub async fn get_key(&self, id: &str) -> Result<Option<SigningKey>, KeyStoreError> {
        let storage_key = Self::storage_key(id)?;
        let Some(bytes) = self.storage.get(&storage_key).await? else {
            return Ok(None);
        };
        let bytes: [u8; 32] = bytes[..]
            .try_into()
            .map_err(|_| KeyStoreError::MalformedKey(id.to_string()))?;
        Ok(Some(SigningKey::from_bytes(&bytes)))
    }

    /// Returns the key for `id`, creating one if there is none yet.
    pub async fn get_or_create_key(&self, id: &str) -> Result<SigningKey, KeyStoreError> {
        match self.get_key(id).await? {
            Some(key) => Ok(key),
            None => self.create_key(id).await,
        }
    }

    pub async fn has_key(&self, id: &str) -> Result<bool, KeyStoreError> {
        let storage_key = Self::storage_key(id)?;
        Ok(self.storage.get(&storage_key).await?.is_some())
    }

    pub async fn remove_key(&self, id: &str) -> Result<(), KeyStoreError> {
        let storage_key = Self::storage_key(id)?;
        self.storage.del(&storage_key).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), KeyStoreError> {
        self.storage.clear().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), KeyStoreError> {
        self.storage.close().await?;
        Ok(())
    }

    /// Verifies a hex signature, remembering signatures that verified before.
    pub fn verify_message(&self, signature: &str, public_key: &str, data: &[u8]) -> bool {
        if let Some((cached_key, cached_data)) = self.verified.lock().get(signature) {
            return cached_key == public_key && cached_data[..] == *data;
        }
        let verified = verify_message(signature, public_key, data);
        if verified {
            self.verified.lock().put(
                signature.to_string(),
                (public_key.to_string(), Bytes::copy_from_slice(data)),
            );
        }
        verified
    }
}

/// Lowercase hex encoding of the public half of `key`.
pub fn public_key_hex(key: &SigningKey) -> String {
    hex::encode(key.verifying_key().as_bytes())
}

/// Signs `data` and returns the signature as lowercase hex.
pub fn sign_message(key: &SigningKey, data: &[u8]) -> String {
    hex::encode(key.sign(data).to_bytes())
}

/// Strictly verifies a hex `signature` over `data` by the hex `public_key`.
///
/// Malformed keys or signatures do not verify.
pub fn verify_message(signature: &str, public_key: &str, data: &[u8]) -> bool {
    let Ok(key) = hex::decode(public_key) else {
        return false;
    };
    let Ok(key) = <[u8; 32]>::try_from(key.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key) else {
        return false;
    };
    let Ok(sig) = hex::decode(signature) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&sig) else {
        return false;
    };
    key.verify_strict(data, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[tokio::test]
    async fn keystore_lifecycle() -> anyhow::Result<()> {
        let keystore = KeyStore::memory();
        assert!(!keystore.has_key("alice").await?);
        let key = keystore.create_key("alice").await?;
        assert!(keystore.has_key("alice").await?);
        let loaded = keystore.get_key("alice").await?.expect("key stored");
        assert_eq!(loaded.to_bytes(), key.to_bytes());
        keystore.remove_key("alice").await?;
        assert!(keystore.get_key("alice").await?.is_none());
        assert!(matches!(keystore.get_key("").await, Err(KeyStoreError::EmptyId)));
        Ok(())
    }

    #[tokio::test]
    async fn keystore_persists_keys() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keystore.redb");
        let key = {
            let keystore = KeyStore::persistent(&path, 10)?;
            let key = keystore.create_key("bob").await?;
            keystore.close().await?;
            key
        };
        let keystore = KeyStore::persistent(&path, 10)?;
        let loaded = keystore.get_key("bob").await?.expect("key persisted");
        assert_eq!(loaded.to_bytes(), key.to_bytes());
        Ok(())
    }

    #[test]
    fn sign_and_verify_messages() {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(1);
        let key = SigningKey::generate(&mut rng);
        let other = SigningKey::generate(&mut rng);
        let sig = sign_message(&key, b"hello");
        assert!(verify_message(&sig, &public_key_hex(&key), b"hello"));
        assert!(!verify_message(&sig, &public_key_hex(&key), b"hellO"));
        assert!(!verify_message(&sig, &public_key_hex(&other), b"hello"));
        assert!(!verify_message("zz", &public_key_hex(&key), b"hello"));

        let keystore = KeyStore::memory();
        assert!(keystore.verify_message(&sig, &public_key_hex(&key), b"hello"));
        // a cached signature still has to match key and data
        assert!(!keystore.verify_message(&sig, &public_key_hex(&other), b"hello"));
        assert!(!keystore.verify_message(&sig, &public_key_hex(&key), b"other"));
    }
}

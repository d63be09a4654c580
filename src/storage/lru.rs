//! Fixed capacity in-memory cache.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use super::{IterOptions, Storage, StorageError, copy_into};

/// Default capacity of an [`LruStorage`].
pub const DEFAULT_LRU_SIZE: NonZeroUsize = NonZeroUsize::new(1_000_000).unwrap();

/// [`Storage`] that evicts the least recently used key once full.
#[derive(Debug)]
pub struct LruStorage {
    cache: Mutex<LruCache<String, Bytes>>,
}

impl Default for LruStorage {
    fn default() -> Self {
        Self::new(DEFAULT_LRU_SIZE)
    }
}

impl LruStorage {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Creates a cache holding `capacity` keys, at least one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
    }
}

#[async_trait]
impl Storage for LruStorage {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        self.cache.lock().put(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(self.cache.lock().get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.cache.lock().pop(key);
        Ok(())
    }

    async fn iter(&self, opts: IterOptions) -> Result<Vec<(String, Bytes)>, StorageError> {
        let mut pairs: Vec<_> = self
            .cache
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        Ok(opts.apply(pairs.into_iter()))
    }

    async fn merge(&self, other: &dyn Storage) -> Result<(), StorageError> {
        copy_into(self, other).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.cache.lock().clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let store = LruStorage::with_capacity(2);
        store.put("a", Bytes::from_static(b"1")).await.unwrap();
        store.put("b", Bytes::from_static(b"2")).await.unwrap();
        // touch a so b becomes the eviction candidate
        assert!(store.get("a").await.unwrap().is_some());
        store.put("c", Bytes::from_static(b"3")).await.unwrap();
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lru_zero_capacity_holds_one() {
        let store = LruStorage::with_capacity(0);
        store.put("a", Bytes::from_static(b"1")).await.unwrap();
        assert!(store.get("a").await.unwrap().is_some());
    }
}

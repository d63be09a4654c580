//! Unbounded in-memory ordered store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{IterOptions, Storage, StorageError, copy_into};

/// In-memory [`Storage`] backed by a [`BTreeMap`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    map: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        self.map.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(self.map.read().get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.map.write().remove(key);
        Ok(())
    }

    async fn iter(&self, opts: IterOptions) -> Result<Vec<(String, Bytes)>, StorageError> {
        let map = self.map.read();
        Ok(opts.apply(map.iter().map(|(k, v)| (k.clone(), v.clone()))))
    }

    async fn merge(&self, other: &dyn Storage) -> Result<(), StorageError> {
        copy_into(self, other).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.map.write().clear();
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
    async fn memory_put_get_del() {
        let store = MemoryStorage::new();
        store.put("b", Bytes::from_static(b"2")).await.unwrap();
        store.put("a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some(&b"1"[..]));
        let keys: Vec<_> = store
            .iter(IterOptions::default())
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["a", "b"]);
        store.del("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        store.clear().await.unwrap();
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_merge_copies_everything() {
        let a = MemoryStorage::new();
        let b = MemoryStorage::new();
        b.put("x", Bytes::from_static(b"1")).await.unwrap();
        b.put("y", Bytes::from_static(b"2")).await.unwrap();
        a.merge(&b).await.unwrap();
        assert_eq!(a.iter(IterOptions::default()).await.unwrap().len(), 2);
    }
}

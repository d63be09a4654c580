//! Two tier read-through, write-through storage.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use super::{IterOptions, Storage, StorageError};

/// Combines a fast `tier1` (usually an [`LruStorage`](super::LruStorage)) with a slower `tier2`.
///
/// Reads check `tier1` first and backfill it from `tier2` on a miss. Writes, deletes and clears
/// go to both tiers.
#[derive(Debug, Clone)]
pub struct ComposedStorage {
    tier1: Arc<dyn Storage>,
    tier2: Arc<dyn Storage>,
}

impl ComposedStorage {
    pub fn new(tier1: Arc<dyn Storage>, tier2: Arc<dyn Storage>) -> Self {
        Self { tier1, tier2 }
    }
}

#[async_trait]
impl Storage for ComposedStorage {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        self.tier1.put(key, value.clone()).await?;
        self.tier2.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        if let Some(value) = self.tier1.get(key).await? {
            return Ok(Some(value));
        }
        let Some(value) = self.tier2.get(key).await? else {
            return Ok(None);
        };
        self.tier1.put(key, value.clone()).await?;
        Ok(Some(value))
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.tier1.del(key).await?;
        self.tier2.del(key).await
    }

    async fn iter(&self, opts: IterOptions) -> Result<Vec<(String, Bytes)>, StorageError> {
        // The limit only applies once both tiers are merged in key order.
        let unbounded = IterOptions {
            limit: None,
            ..opts.clone()
        };
        let mut pairs: BTreeMap<String, Bytes> = self.tier2.iter(unbounded.clone()).await?.into_iter().collect();
        pairs.extend(self.tier1.iter(unbounded).await?);
        Ok(opts.apply(pairs.into_iter()))
    }

    /// Merges `other` into both tiers, then both tiers back into `other`.
    async fn merge(&self, other: &dyn Storage) -> Result<(), StorageError> {
        self.tier1.merge(other).await?;
        self.tier2.merge(other).await?;
        other.merge(self.tier1.as_ref()).await?;
        other.merge(self.tier2.as_ref()).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.tier1.clear().await?;
        self.tier2.clear().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.tier1.close().await?;
        self.tier2.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::storage::{LruStorage, MemoryStorage};

    /// Wraps a store and counts reads.
    #[derive(Debug, Default)]
    struct CountingStorage {
        inner: MemoryStorage,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl Storage for CountingStorage {
        async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
            self.inner.put(key, value).await
        }
        async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }
        async fn del(&self, key: &str) -> Result<(), StorageError> {
            self.inner.del(key).await
        }
        async fn iter(&self, opts: IterOptions) -> Result<Vec<(String, Bytes)>, StorageError> {
            self.inner.iter(opts).await
        }
        async fn merge(&self, other: &dyn Storage) -> Result<(), StorageError> {
            self.inner.merge(other).await
        }
        async fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear().await
        }
        async fn close(&self) -> Result<(), StorageError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn composed_get_backfills_tier1() -> anyhow::Result<()> {
        let tier1 = Arc::new(LruStorage::with_capacity(10));
        let tier2 = Arc::new(CountingStorage::default());
        tier2.inner.put("k", Bytes::from_static(b"v")).await?;
        let storage = ComposedStorage::new(tier1.clone(), tier2.clone());

        assert_eq!(storage.get("k").await?.as_deref(), Some(&b"v"[..]));
        assert_eq!(tier2.gets.load(Ordering::SeqCst), 1);
        assert!(tier1.get("k").await?.is_some());

        assert_eq!(storage.get("k").await?.as_deref(), Some(&b"v"[..]));
        assert_eq!(tier2.gets.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn composed_writes_both_tiers_and_dedups_iteration() -> anyhow::Result<()> {
        let tier1 = Arc::new(MemoryStorage::new());
        let tier2 = Arc::new(MemoryStorage::new());
        let storage = ComposedStorage::new(tier1.clone(), tier2.clone());
        storage.put("a", Bytes::from_static(b"1")).await?;
        tier2.put("b", Bytes::from_static(b"2")).await?;
        assert!(tier2.get("a").await?.is_some());

        let keys: Vec<_> = storage
            .iter(IterOptions::default())
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["a", "b"]);

        storage.del("a").await?;
        assert!(tier1.get("a").await?.is_none());
        assert!(tier2.get("a").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn iteration_is_key_ordered_across_tiers() -> anyhow::Result<()> {
        let tier1 = Arc::new(LruStorage::with_capacity(1));
        let tier2 = Arc::new(MemoryStorage::new());
        let storage = ComposedStorage::new(tier1.clone(), tier2);
        storage.put("b", Bytes::from_static(b"2")).await?;
        storage.put("a", Bytes::from_static(b"1")).await?;
        storage.put("c", Bytes::from_static(b"3")).await?;
        // only "c" is still cached
        assert!(tier1.get("b").await?.is_none());

        let keys = |pairs: Vec<(String, Bytes)>| pairs.into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(keys(storage.iter(IterOptions::default()).await?), ["a", "b", "c"]);
        assert_eq!(keys(storage.iter(IterOptions::reversed(Some(2))).await?), ["c", "b"]);
        let first = IterOptions {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(keys(storage.iter(first).await?), ["a"]);
        let below_c = IterOptions {
            lt: Some("c".to_string()),
            reverse: true,
            ..Default::default()
        };
        assert_eq!(keys(storage.iter(below_c).await?), ["b", "a"]);
        Ok(())
    }

    #[tokio::test]
    async fn merge_copies_both_ways() -> anyhow::Result<()> {
        let storage = ComposedStorage::new(Arc::new(LruStorage::with_capacity(10)), Arc::new(MemoryStorage::new()));
        storage.put("ours", Bytes::from_static(b"1")).await?;
        let other = MemoryStorage::new();
        other.put("theirs", Bytes::from_static(b"2")).await?;

        storage.merge(&other).await?;
        assert!(storage.get("theirs").await?.is_some());
        assert!(other.get("ours").await?.is_some());
        Ok(())
    }
}

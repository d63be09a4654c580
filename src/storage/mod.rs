//! Key to bytes storage tiers.
//!
//! Every store implements [`Storage`]. Databases compose them: a small [`LruStorage`] in front of
//! either a [`PersistentStorage`] (heads, index) or a [`ContentStorage`] (entries, identities,
//! manifests), glued together with [`ComposedStorage`].

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

pub mod composed;
pub mod content;
pub mod fs;
pub mod lru;
pub mod memory;

pub use self::{
    composed::ComposedStorage, content::ContentStorage, fs::PersistentStorage, lru::LruStorage,
    memory::MemoryStorage,
};

/// Errors returned by a [`Storage`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store was closed.
    #[error("storage is closed")]
    Closed,
    /// A network backed operation did not finish in time.
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
    /// Content storage only accepts content identifiers as keys.
    #[error("invalid content key {key:?}: {source}")]
    InvalidKey {
        key: String,
        source: crate::cid::CidError,
    },
    /// Error from the persistent backend.
    #[error(transparent)]
    Database(#[from] redb::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Error from the content network substrate.
    #[error(transparent)]
    Network(#[from] anyhow::Error),
}

/// Range and ordering options for [`Storage::iter`].
#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    pub gt: Option<String>,
    pub gte: Option<String>,
    pub lt: Option<String>,
    pub lte: Option<String>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl IterOptions {
    /// Options yielding the last `amount` keys in descending order.
    pub fn reversed(limit: Option<usize>) -> Self {
        Self {
            limit,
            reverse: true,
            ..Default::default()
        }
    }

    /// Whether `key` lies within the configured range.
    pub fn contains(&self, key: &str) -> bool {
        if self.gt.as_deref().is_some_and(|b| key <= b) {
            return false;
        }
        if self.gte.as_deref().is_some_and(|b| key < b) {
            return false;
        }
        if self.lt.as_deref().is_some_and(|b| key >= b) {
            return false;
        }
        if self.lte.as_deref().is_some_and(|b| key > b) {
            return false;
        }
        true
    }

    /// Applies range, order and limit to pairs sorted ascending by key.
    pub(crate) fn apply(&self, sorted: impl DoubleEndedIterator<Item = (String, Bytes)>) -> Vec<(String, Bytes)> {
        let limit = self.limit.unwrap_or(usize::MAX);
        let in_range = |(k, _): &(String, Bytes)| self.contains(k);
        if self.reverse {
            sorted.rev().filter(in_range).take(limit).collect()
        } else {
            sorted.filter(in_range).take(limit).collect()
        }
    }
}

/// A key to bytes store.
#[async_trait]
pub trait Storage: Debug + Send + Sync + 'static {
    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError>;

    /// Get the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// Remove `key`.
    async fn del(&self, key: &str) -> Result<(), StorageError>;

    /// List the stored pairs, honouring `opts`.
    ///
    /// Stores that cannot enumerate their contents return an empty list.
    async fn iter(&self, opts: IterOptions) -> Result<Vec<(String, Bytes)>, StorageError>;

    /// Absorb the contents of `other`.
    async fn merge(&self, other: &dyn Storage) -> Result<(), StorageError>;

    /// Remove every key.
    async fn clear(&self) -> Result<(), StorageError>;

    /// Release the resources held by the store.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Shared handle to a [`Storage`].
pub type SharedStorage = Arc<dyn Storage>;

/// Copies every pair of `other` into `this`.
pub(crate) async fn copy_into(this: &dyn Storage, other: &dyn Storage) -> Result<(), StorageError> {
    for (key, value) in other.iter(IterOptions::default()).await? {
        this.put(&key, value).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(keys: &[&str]) -> Vec<(String, Bytes)> {
        keys.iter()
            .map(|k| (k.to_string(), Bytes::from(k.to_string())))
            .collect()
    }

    #[test]
    fn iter_options_ranges() {
        let data = pairs(&["a", "b", "c", "d", "e"]);
        let opts = IterOptions {
            gt: Some("a".into()),
            lte: Some("d".into()),
            ..Default::default()
        };
        let keys: Vec<_> = opts.apply(data.clone().into_iter()).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["b", "c", "d"]);

        let opts = IterOptions::reversed(Some(2));
        let keys: Vec<_> = opts.apply(data.into_iter()).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["e", "d"]);
    }
}

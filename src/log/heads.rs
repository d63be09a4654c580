use std::{collections::HashSet, marker::PhantomData, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};

use super::{Entry, LogError};
use crate::{
    cid::Cid,
    storage::{IterOptions, Storage},
};

/// The frontier of a log, persisted as entry bytes keyed by hash.
#[derive(derive_more::Debug)]
pub(crate) struct Heads<T> {
    storage: Arc<dyn Storage>,
    #[debug(skip)]
    _payload: PhantomData<fn() -> T>,
}

/// Returns the entries that no other entry in `entries` names as a predecessor.
pub fn find_heads<T>(entries: &[Entry<T>]) -> Vec<Entry<T>>
where
    T: Clone,
{
    let referenced: HashSet<Cid> = entries.iter().flat_map(|e| e.next().iter().copied()).collect();
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter(|e| !referenced.contains(&e.hash()) && seen.insert(e.hash()))
        .cloned()
        .collect()
}

impl<T> Heads<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub(crate) fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            _payload: PhantomData,
        }
    }

    pub(crate) async fn all(&self) -> Result<Vec<Entry<T>>, LogError> {
        let mut heads = Vec::new();
        for (_, bytes) in self.storage.iter(IterOptions::default()).await? {
            heads.push(Entry::decode(bytes)?);
        }
        Ok(heads)
    }

    /// Adds `head`, dropping any current head it supersedes.
    pub(crate) async fn add(&self, head: Entry<T>) -> Result<(), LogError> {
        let mut heads = self.all().await?;
        if heads.iter().any(|e| e == &head) {
            return Ok(());
        }
        heads.push(head);
        self.set(&find_heads(&heads)).await
    }

    pub(crate) async fn remove(&self, hash: &Cid) -> Result<(), LogError> {
        let heads = self.all().await?;
        if !heads.iter().any(|e| &e.hash() == hash) {
            return Ok(());
        }
        let remaining: Vec<_> = heads.into_iter().filter(|e| &e.hash() != hash).collect();
        self.set(&remaining).await
    }

    /// Replaces the stored heads with the frontier of `heads`.
    pub(crate) async fn set(&self, heads: &[Entry<T>]) -> Result<(), LogError> {
        self.storage.clear().await?;
        for head in find_heads(heads) {
            self.storage.put(&head.hash().to_string(), head.bytes().clone()).await?;
        }
        Ok(())
    }

    pub(crate) async fn clear(&self) -> Result<(), LogError> {
        Ok(self.storage.clear().await?)
    }

    pub(crate) async fn close(&self) -> Result<(), LogError> {
        Ok(self.storage.close().await?)
    }
}

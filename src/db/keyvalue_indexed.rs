use std::{collections::HashSet, ops::Deref, sync::Arc};

use bytes::Bytes;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{Database, DatabaseOptions, DbEntry, DbError, KeyValue, KeyValueEntry, Op, Operation, Value, persistent_storage};
use crate::{
    cid::Cid,
    log::Log,
    storage::{IterOptions, Storage},
};

const INDEXED: Bytes = Bytes::from_static(&[1]);

#[derive(Serialize, Deserialize)]
struct IndexRecord<T> {
    hash: Cid,
    value: T,
}

/// The persisted secondary index of a [`KeyValueIndexed`].
#[derive(Debug)]
struct Index {
    /// key to the latest value.
    values: Arc<dyn Storage>,
    /// Hashes of the entries already applied to `values`.
    indexed: Arc<dyn Storage>,
}

impl Index {
    async fn is_indexed(&self, hash: &Cid) -> Result<bool, DbError> {
        Ok(self.indexed.get(&hash.to_string()).await?.is_some())
    }

    /// Applies the entries up to `latest` that are not indexed yet.
    ///
    /// Walks back from the heads, newest first, until `latest` and every ancestor reached from a
    /// new entry are indexed. The first operation seen for a key decides its value.
    async fn update<T: Value>(&self, log: &Log<Operation<T>>, latest: &DbEntry<T>) -> Result<(), DbError> {
        let mut keys = HashSet::new();
        let mut pending: HashSet<Cid> = HashSet::new();
        let mut applied = 0;
        let mut walk = log.traverse(None, true).await?;
        while let Some(entry) = walk.next().await? {
            let hash = entry.hash();
            pending.remove(&hash);
            let indexed = self.is_indexed(&hash).await?;
            let op = entry.payload();
            if let (Some(key), Op::Put | Op::Del) = (&op.key, op.op) {
                let first = keys.insert(key.clone());
                if first && !indexed {
                    match (op.op, &op.value) {
                        (Op::Put, Some(value)) => {
                            let record = postcard::to_stdvec(&IndexRecord { hash, value })?;
                            self.values.put(key, record.into()).await?;
                        }
                        _ => self.values.del(key).await?,
                    }
                    applied += 1;
                }
            }
            if !indexed {
                self.indexed.put(&hash.to_string(), INDEXED).await?;
            }
            for next in entry.next() {
                if !self.is_indexed(next).await? {
                    pending.insert(*next);
                }
            }
            if pending.is_empty() && self.is_indexed(&latest.hash()).await? {
                break;
            }
        }
        trace!(latest = %latest.hash(), applied, "index updated");
        Ok(())
    }

    async fn get<T: Value>(&self, key: &str) -> Result<Option<IndexRecord<T>>, DbError> {
        match self.values.get(key).await? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self) -> Result<(), DbError> {
        self.values.clear().await?;
        self.indexed.clear().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DbError> {
        self.values.close().await?;
        self.indexed.close().await?;
        Ok(())
    }
}

/// A key-value store answering reads from a persisted index instead of replaying the log.
///
/// The index is brought up to date on every update, local or replicated, by looking only at the
/// entries it has not seen yet.
#[derive(Debug, Clone)]
pub struct KeyValueIndexed<T: Value> {
    kv: KeyValue<T>,
    index: Arc<Index>,
}

impl<T: Value> Deref for KeyValueIndexed<T> {
    type Target = Database<T>;

    fn deref(&self) -> &Self::Target {
        self.kv.database()
    }
}

impl<T: Value> KeyValueIndexed<T> {
    /// Opens the database, keeping the index under `<directory>/<address>/` next to the log.
    pub async fn open(mut options: DatabaseOptions<T>) -> Result<Self, DbError> {
        let directory = options.config.directory.clone();
        let cache_size = options.config.cache_size;
        let index = Arc::new(Index {
            values: persistent_storage(directory.as_deref(), &options.address, "_index", cache_size)?,
            indexed: persistent_storage(directory.as_deref(), &options.address, "_indexedEntries", cache_size)?,
        });

        let chained = options.on_update.take();
        let hook_index = index.clone();
        options.on_update = Some(Arc::new(move |log: Log<Operation<T>>, entry: DbEntry<T>| {
            let index = hook_index.clone();
            let chained = chained.clone();
            async move {
                index.update(&log, &entry).await?;
                if let Some(hook) = chained {
                    hook(log, entry).await?;
                }
                Ok(())
            }
            .boxed()
        }));

        let db = Database::open(options).await?;
        // catch up with entries written while the index was not maintained
        for head in db.log().heads().await? {
            index.update(db.log(), &head).await?;
        }
        Ok(Self {
            kv: KeyValue::new(db),
            index,
        })
    }

    pub fn database(&self) -> &Database<T> {
        self.kv.database()
    }

    pub async fn put(&self, key: impl Into<String>, value: T) -> Result<Cid, DbError> {
        self.kv.put(key, value).await
    }

    /// Alias of [`Self::put`].
    pub async fn set(&self, key: impl Into<String>, value: T) -> Result<Cid, DbError> {
        self.kv.put(key, value).await
    }

    pub async fn del(&self, key: impl Into<String>) -> Result<Cid, DbError> {
        self.kv.del(key).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, DbError> {
        Ok(self.index.get::<T>(key).await?.map(|record| record.value))
    }

    /// Live keys in reverse key order, at most `amount` of them.
    pub async fn iter(&self, amount: Option<usize>) -> Result<Vec<KeyValueEntry<T>>, DbError> {
        if amount == Some(0) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for (key, bytes) in self.index.values.iter(IterOptions::reversed(amount)).await? {
            let IndexRecord { hash, value } = postcard::from_bytes(&bytes)?;
            out.push(KeyValueEntry { key, value, hash });
        }
        Ok(out)
    }

    pub async fn all(&self) -> Result<Vec<KeyValueEntry<T>>, DbError> {
        self.iter(None).await
    }

    /// Drops the log and the index.
    pub async fn drop(&self) -> Result<(), DbError> {
        self.kv.drop().await?;
        self.index.clear().await
    }

    pub async fn close(&self) -> Result<(), DbError> {
        self.kv.close().await?;
        self.index.close().await
    }
}

//! Persistent ordered store on top of [`redb`].

use std::{ops::Bound, path::Path};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use redb::{Database, TableDefinition, backends::InMemoryBackend};
use tracing::{debug, info};

use super::{IterOptions, Storage, StorageError};

/// Table: Key-value pairs
/// Key:   `&str`
/// Value: `&[u8]`
const PAIRS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pairs-1");

/// Disk backed [`Storage`] that keeps keys in lexicographic order.
///
/// `merge` is a no-op: persistent stores are never the source of a merge.
#[derive(Debug)]
pub struct PersistentStorage {
    db: Mutex<Option<Database>>,
}

impl PersistentStorage {
    /// Opens (or creates) the store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("opening persistent store at {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(redb::Error::from)?;
        Self::open(db)
    }

    /// Creates a store that lives in memory only.
    pub fn in_memory() -> Result<Self, StorageError> {
        debug!("using in-memory persistent store");
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(redb::Error::from)?;
        Self::open(db)
    }

    fn open(db: Database) -> Result<Self, StorageError> {
        init_tables(&db)?;
        Ok(Self {
            db: Mutex::new(Some(db)),
        })
    }

    fn with_db<R>(
        &self,
        f: impl FnOnce(&Database) -> Result<R, redb::Error>,
    ) -> Result<R, StorageError> {
        let db = self.db.lock();
        let db = db.as_ref().ok_or(StorageError::Closed)?;
        Ok(f(db)?)
    }
}

fn init_tables(db: &Database) -> Result<(), redb::Error> {
    let write_tx = db.begin_write()?;
    {
        let _table = write_tx.open_table(PAIRS_TABLE)?;
    }
    write_tx.commit()?;
    Ok(())
}

fn range_bounds(opts: &IterOptions) -> (Bound<&str>, Bound<&str>) {
    let lower = match (opts.gt.as_deref(), opts.gte.as_deref()) {
        (Some(gt), _) => Bound::Excluded(gt),
        (None, Some(gte)) => Bound::Included(gte),
        (None, None) => Bound::Unbounded,
    };
    let upper = match (opts.lt.as_deref(), opts.lte.as_deref()) {
        (Some(lt), _) => Bound::Excluded(lt),
        (None, Some(lte)) => Bound::Included(lte),
        (None, None) => Bound::Unbounded,
    };
    (lower, upper)
}

fn is_empty_range(lower: &Bound<&str>, upper: &Bound<&str>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) => {
            l >= u
        }
        _ => false,
    }
}

#[async_trait]
impl Storage for PersistentStorage {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        self.with_db(|db| {
            let tx = db.begin_write()?;
            {
                let mut table = tx.open_table(PAIRS_TABLE)?;
                table.insert(key, &value[..])?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        self.with_db(|db| {
            let tx = db.begin_read()?;
            let table = tx.open_table(PAIRS_TABLE)?;
            let Some(row) = table.get(key)? else {
                return Ok(None);
            };
            Ok(Some(Bytes::copy_from_slice(row.value())))
        })
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.with_db(|db| {
            let tx = db.begin_write()?;
            {
                let mut table = tx.open_table(PAIRS_TABLE)?;
                table.remove(key)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn iter(&self, opts: IterOptions) -> Result<Vec<(String, Bytes)>, StorageError> {
        self.with_db(|db| {
            let (lower, upper) = range_bounds(&opts);
            if is_empty_range(&lower, &upper) {
                return Ok(Vec::new());
            }
            let tx = db.begin_read()?;
            let table = tx.open_table(PAIRS_TABLE)?;
            let range = table.range::<&str>((lower, upper))?;
            let limit = opts.limit.unwrap_or(usize::MAX);
            let rows: Box<dyn Iterator<Item = _>> = if opts.reverse {
                Box::new(range.rev())
            } else {
                Box::new(range)
            };
            let mut pairs = Vec::new();
            for row in rows.take(limit) {
                let (key, value) = row?;
                pairs.push((key.value().to_string(), Bytes::copy_from_slice(value.value())));
            }
            Ok(pairs)
        })
    }

    async fn merge(&self, _other: &dyn Storage) -> Result<(), StorageError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.with_db(|db| {
            let tx = db.begin_write()?;
            {
                let mut table = tx.open_table(PAIRS_TABLE)?;
                table.retain(|_, _| false)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.db.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persistent_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log").join("_heads.redb");
        let store = PersistentStorage::persistent(&path)?;
        store.put("k", Bytes::from_static(b"v")).await?;
        store.close().await?;
        assert!(matches!(store.get("k").await, Err(StorageError::Closed)));

        let store = PersistentStorage::persistent(&path)?;
        assert_eq!(store.get("k").await?.as_deref(), Some(&b"v"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn persistent_range_iteration() -> anyhow::Result<()> {
        let store = PersistentStorage::in_memory()?;
        for key in ["a", "b", "c", "d"] {
            store.put(key, Bytes::from(key.to_string())).await?;
        }
        let keys = |pairs: Vec<(String, Bytes)>| pairs.into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        let opts = IterOptions {
            gte: Some("b".into()),
            lt: Some("d".into()),
            ..Default::default()
        };
        assert_eq!(keys(store.iter(opts).await?), ["b", "c"]);
        assert_eq!(keys(store.iter(IterOptions::reversed(Some(3))).await?), ["d", "c", "b"]);
        let empty = IterOptions {
            gt: Some("c".into()),
            lt: Some("b".into()),
            ..Default::default()
        };
        assert!(store.iter(empty).await?.is_empty());
        store.clear().await?;
        assert!(store.iter(IterOptions::default()).await?.is_empty());
        Ok(())
    }
}

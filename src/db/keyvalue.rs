use std::{collections::HashSet, ops::Deref};

use super::{Database, DbError, KeyValueEntry, Op, Operation, Value};
use crate::{cid::Cid, log::Log};

/// A key-value store replayed from the log: the newest operation on a key wins.
#[derive(Debug, Clone)]
pub struct KeyValue<T: Value> {
    db: Database<T>,
}

impl<T: Value> Deref for KeyValue<T> {
    type Target = Database<T>;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl<T: Value> KeyValue<T> {
    pub fn new(db: Database<T>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database<T> {
        &self.db
    }

    /// Sets `key` to `value`.
    pub async fn put(&self, key: impl Into<String>, value: T) -> Result<Cid, DbError> {
        self.db.add_operation(Operation::put(key, value)).await
    }

    /// Alias of [`Self::put`].
    pub async fn set(&self, key: impl Into<String>, value: T) -> Result<Cid, DbError> {
        self.put(key, value).await
    }

    pub async fn del(&self, key: impl Into<String>) -> Result<Cid, DbError> {
        self.db.add_operation(Operation::del(key)).await
    }

    /// The current value of `key`, `None` if it was never set or deleted last.
    pub async fn get(&self, key: &str) -> Result<Option<T>, DbError> {
        latest(self.db.log(), key).await
    }

    /// Live keys, newest first, at most `amount` of them.
    pub async fn iter(&self, amount: Option<usize>) -> Result<Vec<KeyValueEntry<T>>, DbError> {
        live(self.db.log(), amount).await
    }

    /// All live keys, newest first.
    pub async fn all(&self) -> Result<Vec<KeyValueEntry<T>>, DbError> {
        self.iter(None).await
    }
}

/// Finds the newest `PUT` or `DEL` of `key`.
pub(super) async fn latest<T: Value>(log: &Log<Operation<T>>, key: &str) -> Result<Option<T>, DbError> {
    let mut walk = log.traverse(None, true).await?;
    while let Some(entry) = walk.next().await? {
        let op = entry.payload();
        if op.key.as_deref() != Some(key) {
            continue;
        }
        match op.op {
            Op::Put => return Ok(op.value.clone()),
            Op::Del => return Ok(None),
            Op::Add => {}
        }
    }
    Ok(None)
}

/// Replays the log newest first, yielding each live key once.
pub(super) async fn live<T: Value>(
    log: &Log<Operation<T>>,
    amount: Option<usize>,
) -> Result<Vec<KeyValueEntry<T>>, DbError> {
    let mut out = Vec::new();
    if amount == Some(0) {
        return Ok(out);
    }
    let mut seen = HashSet::new();
    let mut walk = log.traverse(None, true).await?;
    while let Some(entry) = walk.next().await? {
        let hash = entry.hash();
        let Operation { op, key, value } = entry.payload().clone();
        let Some(key) = key else {
            continue;
        };
        if !seen.insert(key.clone()) {
            continue;
        }
        match (op, value) {
            (Op::Put, Some(value)) => out.push(KeyValueEntry { key, value, hash }),
            _ => continue,
        }
        if amount.is_some_and(|amount| out.len() >= amount) {
            break;
        }
    }
    Ok(out)
}

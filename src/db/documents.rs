use std::{ops::Deref, sync::Arc};

use super::{
    Database, DbError, KeyValueEntry, Operation, Value,
    keyvalue::{latest, live},
};
use crate::cid::Cid;

/// Document field used as the key unless configured otherwise.
pub const DEFAULT_INDEX_BY: &str = "_id";

/// A document store: documents are keyed by one of their fields.
#[derive(Debug, Clone)]
pub struct Documents<T: Value> {
    db: Database<T>,
    index_by: Arc<str>,
}

impl<T: Value> Deref for Documents<T> {
    type Target = Database<T>;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl<T: Value> Documents<T> {
    pub fn new(db: Database<T>, index_by: impl Into<String>) -> Self {
        Self {
            db,
            index_by: index_by.into().into(),
        }
    }

    pub fn database(&self) -> &Database<T> {
        &self.db
    }

    /// The document field documents are keyed by.
    pub fn index_by(&self) -> &str {
        &self.index_by
    }

    /// The key of `doc`: its index field, which must be a string or a number.
    pub fn key_of(&self, doc: &T) -> Result<String, DbError> {
        let value = serde_json::to_value(doc)?;
        match value.get(&*self.index_by) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            _ => Err(DbError::MissingIndex(self.index_by.to_string())),
        }
    }

    /// Stores `doc` under its key, replacing the previous version.
    pub async fn put(&self, doc: T) -> Result<Cid, DbError> {
        let key = self.key_of(&doc)?;
        self.db.add_operation(Operation::put(key, doc)).await
    }

    /// Deletes the document stored under `key`.
    pub async fn del(&self, key: &str) -> Result<Cid, DbError> {
        if self.get(key).await?.is_none() {
            return Err(DbError::NotFound(key.to_string()));
        }
        self.db.add_operation(Operation::del(key)).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, DbError> {
        latest(self.db.log(), key).await
    }

    /// Live documents, newest first, at most `amount` of them.
    pub async fn iter(&self, amount: Option<usize>) -> Result<Vec<KeyValueEntry<T>>, DbError> {
        live(self.db.log(), amount).await
    }

    pub async fn all(&self) -> Result<Vec<KeyValueEntry<T>>, DbError> {
        self.iter(None).await
    }

    /// Live documents matching `filter`, newest first.
    pub async fn query(&self, filter: impl Fn(&T) -> bool) -> Result<Vec<T>, DbError> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .map(|entry| entry.value)
            .filter(|doc| filter(doc))
            .collect())
    }
}

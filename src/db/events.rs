use std::ops::Deref;

use super::{Database, DbEntry, DbError, Op, Operation, Value};
use crate::{cid::Cid, log::LogIterOptions};

/// An event and the hash of the entry that recorded it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEntry<T> {
    pub hash: Cid,
    pub value: T,
}

impl<T: Clone> EventEntry<T> {
    fn from_entry(entry: &DbEntry<T>) -> Option<Self> {
        let op = entry.payload();
        match (op.op, &op.value) {
            (Op::Add, Some(value)) => Some(Self {
                hash: entry.hash(),
                value: value.clone(),
            }),
            _ => None,
        }
    }
}

/// An append-only event log.
#[derive(Debug, Clone)]
pub struct Events<T: Value> {
    db: Database<T>,
}

impl<T: Value> Deref for Events<T> {
    type Target = Database<T>;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl<T: Value> Events<T> {
    pub fn new(db: Database<T>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database<T> {
        &self.db
    }

    /// Appends `value` and returns the hash of its entry.
    pub async fn add(&self, value: T) -> Result<Cid, DbError> {
        self.db.add_operation(Operation::add(value)).await
    }

    /// The event recorded by the entry `hash`.
    pub async fn get(&self, hash: &Cid) -> Result<Option<T>, DbError> {
        let entry = self.db.log().get(hash).await?;
        Ok(entry.and_then(|e| EventEntry::from_entry(&e)).map(|e| e.value))
    }

    /// Events within `opts`, newest first.
    pub async fn iter(&self, opts: LogIterOptions) -> Result<Vec<EventEntry<T>>, DbError> {
        let entries = self.db.log().iter(opts).await?;
        Ok(entries.iter().filter_map(EventEntry::from_entry).collect())
    }

    /// Every event, oldest first.
    pub async fn all(&self) -> Result<Vec<EventEntry<T>>, DbError> {
        let mut events = self.iter(LogIterOptions::default()).await?;
        events.reverse();
        Ok(events)
    }
}

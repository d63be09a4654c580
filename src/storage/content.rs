//! Storage backed by the content network.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use super::{IterOptions, Storage, StorageError};
use crate::{cid::Cid, net::BlockStore};

/// Default timeout for block reads and writes.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// [`Storage`] that reads and writes blocks through a [`BlockStore`].
///
/// Keys must be [`Cid`] strings. The network is the source of truth and cannot be enumerated,
/// so `del`, `iter`, `merge`, `clear` and `close` do nothing.
#[derive(Debug, Clone)]
pub struct ContentStorage {
    blocks: Arc<dyn BlockStore>,
    pin: bool,
    timeout: Duration,
}

impl ContentStorage {
    pub fn new(blocks: Arc<dyn BlockStore>) -> Self {
        Self {
            blocks,
            pin: true,
            timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }

    /// Whether blocks are pinned after they are written.
    pub fn pin(mut self, pin: bool) -> Self {
        self.pin = pin;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn parse_key(key: &str) -> Result<Cid, StorageError> {
        key.parse().map_err(|source| StorageError::InvalidKey {
            key: key.to_string(),
            source,
        })
    }
}

#[async_trait]
impl Storage for ContentStorage {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        let cid = Self::parse_key(key)?;
        let op = async {
            self.blocks.put(&cid, value).await?;
            if self.pin {
                self.blocks.pin(&cid).await?;
            }
            anyhow::Ok(())
        };
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))??;
        trace!(%cid, pinned = self.pin, "stored block");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let cid = Self::parse_key(key)?;
        let block = tokio::time::timeout(self.timeout, self.blocks.get(&cid))
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))??;
        Ok(block)
    }

    async fn del(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn iter(&self, _opts: IterOptions) -> Result<Vec<(String, Bytes)>, StorageError> {
        Ok(Vec::new())
    }

    async fn merge(&self, _other: &dyn Storage) -> Result<(), StorageError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

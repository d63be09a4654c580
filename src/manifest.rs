//! Manifests: the content addressed descriptors that databases are addressed by.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    address::Address,
    cid::Cid,
    storage::{Storage, StorageError},
};

/// Describes a database. Its hash is the database [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Address of the access controller guarding the database.
    pub access_controller: String,
    pub name: String,
    /// The database type, e.g. `keyvalue`.
    #[serde(rename = "type")]
    pub kind: String,
    pub meta: Option<String>,
}

/// Errors from the [`ManifestStore`].
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest requires a {0}")]
    Missing(&'static str),
    #[error("failed to encode manifest: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("manifest is followed by {0} trailing bytes")]
    TrailingBytes(usize),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Stores manifests by hash.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    storage: Arc<dyn Storage>,
}

impl ManifestStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Stores a new manifest and returns it with its address.
    pub async fn create(
        &self,
        name: &str,
        kind: &str,
        access_controller: &str,
        meta: Option<String>,
    ) -> Result<(Address, Manifest), ManifestError> {
        if name.is_empty() {
            return Err(ManifestError::Missing("name"));
        }
        if kind.is_empty() {
            return Err(ManifestError::Missing("type"));
        }
        if access_controller.is_empty() {
            return Err(ManifestError::Missing("access controller"));
        }
        let manifest = Manifest {
            access_controller: access_controller.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            meta,
        };
        let bytes = postcard::to_stdvec(&manifest)?;
        let cid = Cid::hash_of(&bytes);
        self.storage.put(&cid.to_string(), bytes.into()).await?;
        debug!(%cid, name, kind, "created manifest");
        Ok((Address::new(cid), manifest))
    }

    /// Loads the manifest of `address`.
    pub async fn get(&self, address: &Address) -> Result<Option<Manifest>, ManifestError> {
        let Some(bytes) = self.storage.get(&address.cid().to_string()).await? else {
            return Ok(None);
        };
        let (manifest, rest) = postcard::take_from_bytes(&bytes)?;
        if !rest.is_empty() {
            return Err(ManifestError::TrailingBytes(rest.len()));
        }
        Ok(Some(manifest))
    }

    pub async fn close(&self) -> Result<(), ManifestError> {
        Ok(self.storage.close().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn create_and_get() -> anyhow::Result<()> {
        let store = ManifestStore::new(Arc::new(MemoryStorage::new()));
        let (address, manifest) = store
            .create("db", "keyvalue", "/ipfs/bac", Some("meta".to_string()))
            .await?;
        assert_eq!(store.get(&address).await?, Some(manifest.clone()));
        // same description, same address
        let (again, _) = store.create("db", "keyvalue", "/ipfs/bac", Some("meta".to_string())).await?;
        assert_eq!(again, address);
        let (other, _) = store.create("db", "events", "/ipfs/bac", None).await?;
        assert_ne!(other, address);
        assert_eq!(store.get(&Address::new(Cid::hash_of(b"nothing"))).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn padded_manifests_are_rejected() -> anyhow::Result<()> {
        let storage = Arc::new(MemoryStorage::new());
        let store = ManifestStore::new(storage.clone());
        let manifest = Manifest {
            access_controller: "/ipfs/bac".to_string(),
            name: "db".to_string(),
            kind: "keyvalue".to_string(),
            meta: None,
        };
        let mut bytes = postcard::to_stdvec(&manifest)?;
        bytes.push(0);
        let address = Address::new(Cid::hash_of(&bytes));
        storage.put(&address.cid().to_string(), bytes.into()).await?;
        assert!(matches!(store.get(&address).await, Err(ManifestError::TrailingBytes(1))));
        Ok(())
    }

    #[tokio::test]
    async fn fields_are_required() {
        let store = ManifestStore::new(Arc::new(MemoryStorage::new()));
        let err = store.create("", "keyvalue", "/ipfs/bac", None).await.unwrap_err();
        assert!(matches!(err, ManifestError::Missing("name")));
    }
}

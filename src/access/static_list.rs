use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{ANYONE, AccessError, AccessKind, writer};
use crate::{
    cid::Cid,
    identities::Identities,
    log::{Entry, Payload},
    storage::Storage,
};

/// Persisted form of a [`StaticAccess`].
#[derive(Debug, Serialize, Deserialize)]
struct WriteList {
    write: Vec<String>,
    #[serde(rename = "type")]
    kind: String,
}

/// A write list fixed when the database is created.
///
/// The list is stored as a content addressed manifest, so its address changes with its
/// contents.
#[derive(Debug, Clone)]
pub struct StaticAccess {
    identities: Identities,
    write: Arc<Vec<String>>,
    address: String,
}

impl StaticAccess {
    /// Builds the controller without storing its manifest.
    pub fn new(identities: Identities, write: Vec<String>) -> Result<Self, AccessError> {
        let (address, _) = encode(&write)?;
        Ok(Self {
            identities,
            write: Arc::new(write),
            address,
        })
    }

    /// Stores the write list in `storage` and returns the controller.
    pub async fn create(
        storage: &dyn Storage,
        identities: Identities,
        write: Vec<String>,
    ) -> Result<Self, AccessError> {
        let (address, bytes) = encode(&write)?;
        let key = address_cid(&address);
        storage.put(key, bytes.into()).await?;
        Ok(Self {
            identities,
            write: Arc::new(write),
            address,
        })
    }

    /// Loads the write list stored at `address`.
    pub async fn open(storage: &dyn Storage, identities: Identities, address: &str) -> Result<Self, AccessError> {
        let bytes = storage
            .get(address_cid(address))
            .await?
            .ok_or_else(|| AccessError::NotFound(address.to_string()))?;
        let list: WriteList = postcard::from_bytes(&bytes)?;
        Ok(Self {
            identities,
            write: Arc::new(list.write),
            address: address.to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The identity ids allowed to write.
    pub fn write(&self) -> &[String] {
        &self.write
    }

    pub async fn can_append<T: Payload>(&self, entry: &Entry<T>) -> Result<bool, AccessError> {
        let Some(identity) = writer(&self.identities, entry).await? else {
            trace!(entry = %entry.hash(), "writer identity unknown");
            return Ok(false);
        };
        let listed = self.write.iter().any(|w| w == identity.id() || w == ANYONE);
        Ok(listed && self.identities.verify_identity(&identity))
    }
}

fn encode(write: &[String]) -> Result<(String, Vec<u8>), AccessError> {
    let bytes = postcard::to_stdvec(&WriteList {
        write: write.to_vec(),
        kind: AccessKind::Static.as_str().to_string(),
    })?;
    let address = format!("/{}/{}", AccessKind::Static, Cid::hash_of(&bytes));
    Ok((address, bytes))
}

fn address_cid(address: &str) -> &str {
    address.rsplit('/').next().unwrap_or(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{log::Clock, storage::MemoryStorage};

    #[tokio::test]
    async fn address_follows_the_write_list() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let identities = Identities::memory();
        let a = StaticAccess::create(&storage, identities.clone(), vec!["a".into()]).await?;
        let b = StaticAccess::new(identities.clone(), vec!["a".into()])?;
        let c = StaticAccess::new(identities.clone(), vec!["a".into(), "b".into()])?;
        assert!(a.address().starts_with("/ipfs/b"));
        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), c.address());

        let opened = StaticAccess::open(&storage, identities.clone(), a.address()).await?;
        assert_eq!(opened.write(), ["a".to_string()]);
        assert!(matches!(
            StaticAccess::open(&storage, identities, c.address()).await,
            Err(AccessError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn only_listed_writers_append() -> anyhow::Result<()> {
        let identities = Identities::memory();
        let alice = identities.create_identity("alice", None).await?;
        let bob = identities.create_identity("bob", None).await?;
        let access = StaticAccess::new(identities.clone(), vec![alice.id().to_string()])?;

        let by_alice = Entry::create(&alice, "log", "x".to_string(), Clock::new(alice.public_key(), 1), vec![], vec![])?;
        let by_bob = Entry::create(&bob, "log", "x".to_string(), Clock::new(bob.public_key(), 1), vec![], vec![])?;
        assert!(access.can_append(&by_alice).await?);
        assert!(!access.can_append(&by_bob).await?);

        let anyone = StaticAccess::new(identities, vec![ANYONE.to_string()])?;
        assert!(anyone.can_append(&by_bob).await?);
        Ok(())
    }
}

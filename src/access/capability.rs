use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::{ANYONE, AccessController, AccessError, writer};
use crate::{
    db::{DatabaseEvent, KeyValue},
    identities::Identities,
    log::{Entry, Payload},
};

/// May grant and revoke capabilities, and write.
pub const ADMIN_CAPABILITY: &str = "admin";
/// May write.
pub const WRITE_CAPABILITY: &str = "write";

/// Capabilities granted at runtime.
///
/// Grants live in a key-value database mapping a capability name to the identity ids holding
/// it. That database is itself guarded by a static write list whose members are always admins.
#[derive(Debug, Clone)]
pub struct CapabilityAccess {
    identities: Identities,
    db: KeyValue<Vec<String>>,
}

impl CapabilityAccess {
    pub fn new(identities: Identities, db: KeyValue<Vec<String>>) -> Self {
        Self { identities, db }
    }

    /// `/orbitdb/<cid>` of the database holding the grants.
    pub fn address(&self) -> String {
        self.db.address().to_string()
    }

    pub fn database(&self) -> &KeyValue<Vec<String>> {
        &self.db
    }

    /// Every capability and its holders, including the implicit admins.
    pub async fn capabilities(&self) -> Result<BTreeMap<String, BTreeSet<String>>, AccessError> {
        let mut caps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for entry in self.db.all().await? {
            caps.entry(entry.key).or_default().extend(entry.value);
        }
        if let AccessController::Static(access) = self.db.access() {
            caps.entry(ADMIN_CAPABILITY.to_string())
                .or_default()
                .extend(access.write().iter().cloned());
        }
        Ok(caps)
    }

    /// The identity ids holding `capability`.
    pub async fn get(&self, capability: &str) -> Result<BTreeSet<String>, AccessError> {
        Ok(self.capabilities().await?.remove(capability).unwrap_or_default())
    }

    async fn has_capability(&self, capability: &str, id: &str) -> Result<bool, AccessError> {
        let holders = self.get(capability).await?;
        Ok(holders.contains(id) || holders.contains(ANYONE))
    }

    /// Adds `id` to the holders of `capability`.
    pub async fn grant(&self, capability: &str, id: &str) -> Result<(), AccessError> {
        let mut holders: Vec<String> = self.db.get(capability).await?.unwrap_or_default();
        if !holders.iter().any(|h| h == id) {
            holders.push(id.to_string());
        }
        self.db.put(capability, holders).await?;
        debug!(capability, id, "granted capability");
        Ok(())
    }

    /// Removes `id` from the holders of `capability`, deleting the capability once nobody holds
    /// it.
    pub async fn revoke(&self, capability: &str, id: &str) -> Result<(), AccessError> {
        let mut holders: Vec<String> = self.db.get(capability).await?.unwrap_or_default();
        holders.retain(|h| h != id);
        if holders.is_empty() {
            self.db.del(capability).await?;
        } else {
            self.db.put(capability, holders).await?;
        }
        debug!(capability, id, "revoked capability");
        Ok(())
    }

    pub async fn can_append<T: Payload>(&self, entry: &Entry<T>) -> Result<bool, AccessError> {
        let Some(identity) = writer(&self.identities, entry).await? else {
            trace!(entry = %entry.hash(), "writer identity unknown");
            return Ok(false);
        };
        let id = identity.id();
        let allowed =
            self.has_capability(WRITE_CAPABILITY, id).await? || self.has_capability(ADMIN_CAPABILITY, id).await?;
        Ok(allowed && self.identities.verify_identity(&identity))
    }

    /// Notifications about grants, e.g. updates replicated from other admins.
    pub fn events(&self) -> broadcast::Receiver<DatabaseEvent<Vec<String>>> {
        self.db.events()
    }

    pub async fn close(&self) -> Result<(), AccessError> {
        Ok(self.db.close().await?)
    }

    /// Forgets every grant.
    pub async fn drop(&self) -> Result<(), AccessError> {
        Ok(self.db.drop().await?)
    }
}

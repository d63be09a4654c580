use tracing::{debug, trace};

use super::{AccessError, writer};
use crate::{
    db::KeyValue,
    identities::Identities,
    log::{Entry, Payload},
};

/// Every operation, on one key or on all of them.
pub const ALL_CAPABILITY: &str = "*";
pub const PUT_CAPABILITY: &str = "PUT";
pub const DEL_CAPABILITY: &str = "DEL";

/// Storage key of the capabilities `id` holds on `key`.
///
/// Both parts are trimmed and `/` is replaced with `-`.
pub fn format_key(id: &str, key: &str) -> String {
    let clean = |s: &str| s.trim().replace('/', "-");
    format!("{}:{}", clean(id), clean(key))
}

/// `PUT` and `DEL` capabilities per identity and key.
///
/// An entry is accepted when its writer holds the capability named by the entry operation on
/// the entry key, or on `*` when the entry has no key.
#[derive(Debug, Clone)]
pub struct ResourceAccess {
    identities: Identities,
    db: KeyValue<Vec<String>>,
}

impl ResourceAccess {
    pub fn new(identities: Identities, db: KeyValue<Vec<String>>) -> Self {
        Self { identities, db }
    }

    /// `/resource/<cid>` of the database holding the grants.
    pub fn address(&self) -> String {
        format!("/resource/{}", self.db.address().cid())
    }

    pub fn database(&self) -> &KeyValue<Vec<String>> {
        &self.db
    }

    /// Capabilities `id` holds on `key`.
    pub async fn capabilities(&self, id: &str, key: &str) -> Result<Vec<String>, AccessError> {
        Ok(self.db.get(&format_key(id, key)).await?.unwrap_or_default())
    }

    pub async fn has_capability(&self, id: &str, key: &str, capability: &str) -> Result<bool, AccessError> {
        let caps = self.capabilities(id, key).await?;
        Ok(caps.iter().any(|c| c == ALL_CAPABILITY || c == capability))
    }

    /// Grants `capabilities` on `key` to `id`. Granting `*` replaces everything else.
    pub async fn grant(&self, id: &str, key: &str, capabilities: &[&str]) -> Result<(), AccessError> {
        let record = format_key(id, key);
        let caps = if capabilities.contains(&ALL_CAPABILITY) {
            vec![ALL_CAPABILITY.to_string()]
        } else {
            let mut caps = self.db.get(&record).await?.unwrap_or_default();
            for cap in capabilities {
                if !caps.iter().any(|c| c == cap) {
                    caps.push(cap.to_string());
                }
            }
            caps
        };
        self.db.put(record, caps).await?;
        debug!(id, key, ?capabilities, "granted");
        Ok(())
    }

    /// Takes `capabilities` on `key` away from `id`.
    ///
    /// Revoking `*` removes every capability. Revoking from a holder of `*` leaves the remaining
    /// ones of `PUT` and `DEL`.
    pub async fn revoke(&self, id: &str, key: &str, capabilities: &[&str]) -> Result<(), AccessError> {
        let record = format_key(id, key);
        let Some(current) = self.db.get(&record).await? else {
            return Ok(());
        };
        let remaining: Vec<String> = if capabilities.contains(&ALL_CAPABILITY) {
            Vec::new()
        } else if current.iter().any(|c| c == ALL_CAPABILITY) {
            [PUT_CAPABILITY, DEL_CAPABILITY]
                .into_iter()
                .filter(|c| !capabilities.contains(c))
                .map(String::from)
                .collect()
        } else {
            current
                .into_iter()
                .filter(|c| !capabilities.contains(&c.as_str()))
                .collect()
        };
        if remaining.is_empty() {
            self.db.del(record).await?;
        } else {
            self.db.put(record, remaining).await?;
        }
        debug!(id, key, ?capabilities, "revoked");
        Ok(())
    }

    pub async fn can_append<T: Payload>(&self, entry: &Entry<T>) -> Result<bool, AccessError> {
        let Some((op, key)) = entry.payload().operation() else {
            trace!(entry = %entry.hash(), "entry carries no operation");
            return Ok(false);
        };
        let Some(identity) = writer(&self.identities, entry).await? else {
            trace!(entry = %entry.hash(), "writer identity unknown");
            return Ok(false);
        };
        let key = key.unwrap_or(ALL_CAPABILITY);
        Ok(self.has_capability(identity.id(), key, op).await? && self.identities.verify_identity(&identity))
    }

    pub async fn close(&self) -> Result<(), AccessError> {
        Ok(self.db.close().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::{AccessController, StaticAccess},
        db::{Operation, tests::open_db_on},
        identities::Identity,
        log::Clock,
        test_utils::MemoryNetwork,
    };

    fn op_by(identity: &Identity, op: Operation<String>) -> anyhow::Result<Entry<Operation<String>>> {
        Ok(Entry::create(
            identity,
            "log",
            op,
            Clock::new(identity.public_key(), 1),
            vec![],
            vec![],
        )?)
    }

    async fn setup() -> anyhow::Result<(MemoryNetwork, Identities, Identity, ResourceAccess)> {
        let net = MemoryNetwork::new();
        let identities = Identities::memory();
        let admin = identities.create_identity("admin", None).await?;
        let guard = StaticAccess::new(identities.clone(), vec![admin.id().to_string()])?;
        let db = open_db_on(
            net.node(),
            identities.clone(),
            admin.clone(),
            "docs/_acl",
            AccessController::Static(guard),
        )
        .await?;
        let access = ResourceAccess::new(identities.clone(), KeyValue::new(db));
        Ok((net, identities, admin, access))
    }

    #[test]
    fn keys_are_normalized() {
        assert_eq!(format_key(" alice ", "a/b"), "alice:a-b");
        assert_eq!(format_key("bob", "*"), "bob:*");
    }

    #[tokio::test]
    async fn put_and_del_per_key() -> anyhow::Result<()> {
        let (_net, identities, _admin, access) = setup().await?;
        let alice = identities.create_identity("alice", None).await?;
        let id = alice.id();

        access.grant(id, "k1", &[PUT_CAPABILITY]).await?;
        assert!(access.can_append(&op_by(&alice, Operation::put("k1", "v".into()))?).await?);
        assert!(!access.can_append(&op_by(&alice, Operation::del("k1"))?).await?);
        assert!(!access.can_append(&op_by(&alice, Operation::put("k2", "v".into()))?).await?);

        access.grant(id, "k1", &[DEL_CAPABILITY, PUT_CAPABILITY]).await?;
        assert_eq!(access.capabilities(id, "k1").await?, [PUT_CAPABILITY, DEL_CAPABILITY]);
        assert!(access.can_append(&op_by(&alice, Operation::del("k1"))?).await?);

        access.revoke(id, "k1", &[PUT_CAPABILITY, DEL_CAPABILITY]).await?;
        assert!(access.capabilities(id, "k1").await?.is_empty());
        assert!(!access.can_append(&op_by(&alice, Operation::put("k1", "v".into()))?).await?);
        Ok(())
    }

    #[tokio::test]
    async fn wildcard_capabilities() -> anyhow::Result<()> {
        let (_net, identities, _admin, access) = setup().await?;
        let bob = identities.create_identity("bob", None).await?;
        let id = bob.id();

        access.grant(id, "k", &[PUT_CAPABILITY, ALL_CAPABILITY]).await?;
        assert_eq!(access.capabilities(id, "k").await?, [ALL_CAPABILITY]);
        assert!(access.can_append(&op_by(&bob, Operation::del("k"))?).await?);

        access.revoke(id, "k", &[DEL_CAPABILITY]).await?;
        assert_eq!(access.capabilities(id, "k").await?, [PUT_CAPABILITY]);

        access.grant(id, "k", &[ALL_CAPABILITY]).await?;
        access.revoke(id, "k", &[ALL_CAPABILITY]).await?;
        assert!(access.capabilities(id, "k").await?.is_empty());

        // keyless operations are checked against `*`
        assert!(!access.can_append(&op_by(&bob, Operation::add("e".into()))?).await?);
        access.grant(id, ALL_CAPABILITY, &[ALL_CAPABILITY]).await?;
        assert!(access.can_append(&op_by(&bob, Operation::add("e".into()))?).await?);
        Ok(())
    }

    #[tokio::test]
    async fn plain_payloads_are_rejected() -> anyhow::Result<()> {
        let (_net, identities, _admin, access) = setup().await?;
        let bob = identities.create_identity("bob", None).await?;
        access.grant(bob.id(), ALL_CAPABILITY, &[ALL_CAPABILITY]).await?;
        let entry = Entry::create(&bob, "log", "raw".to_string(), Clock::new(bob.public_key(), 1), vec![], vec![])?;
        assert!(!access.can_append(&entry).await?);
        Ok(())
    }
}

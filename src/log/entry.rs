use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::Clock;
use crate::{
    cid::Cid,
    identities::{Identities, Identity, IdentityError},
};

/// Format version written into every entry.
pub const ENTRY_VERSION: u8 = 2;

/// Errors creating or decoding an [`Entry`].
#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("entry requires a log id")]
    MissingId,
    #[error("failed to sign entry: {0}")]
    Sign(#[from] IdentityError),
    #[error("failed to encode entry: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("entry is followed by {0} trailing bytes")]
    TrailingBytes(usize),
}

/// The signed part of an entry.
#[derive(Serialize)]
struct UnsignedEntry<'a, T> {
    id: &'a str,
    payload: &'a T,
    next: &'a [Cid],
    refs: &'a [Cid],
    clock: &'a Clock,
    v: u8,
}

#[derive(Serialize)]
struct SignedEntry<'a, T> {
    id: &'a str,
    payload: &'a T,
    next: &'a [Cid],
    refs: &'a [Cid],
    clock: &'a Clock,
    v: u8,
    key: &'a str,
    identity: &'a Cid,
    sig: &'a str,
}

#[derive(Deserialize)]
struct DecodedEntry<T> {
    id: String,
    payload: T,
    next: Vec<Cid>,
    refs: Vec<Cid>,
    clock: Clock,
    v: u8,
    key: String,
    identity: Cid,
    sig: String,
}

/// An immutable, signed, content addressed log record.
///
/// Two entries are equal when their hashes are equal.
#[derive(derive_more::Debug, Clone)]
pub struct Entry<T> {
    id: String,
    payload: T,
    next: Vec<Cid>,
    refs: Vec<Cid>,
    clock: Clock,
    v: u8,
    key: String,
    identity: Cid,
    sig: String,
    hash: Cid,
    #[debug(skip)]
    bytes: Bytes,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl<T> Eq for Entry<T> {}

impl<T: Serialize + DeserializeOwned> Entry<T> {
    /// Builds and signs a new entry for the log `log_id`.
    pub fn create(
        identity: &Identity,
        log_id: &str,
        payload: T,
        clock: Clock,
        next: Vec<Cid>,
        refs: Vec<Cid>,
    ) -> Result<Self, EntryError> {
        if log_id.is_empty() {
            return Err(EntryError::MissingId);
        }
        let unsigned = postcard::to_stdvec(&UnsignedEntry {
            id: log_id,
            payload: &payload,
            next: &next,
            refs: &refs,
            clock: &clock,
            v: ENTRY_VERSION,
        })?;
        let sig = identity.sign(&unsigned)?;
        let key = identity.public_key().to_string();
        let identity = identity.hash();
        let bytes = postcard::to_stdvec(&SignedEntry {
            id: log_id,
            payload: &payload,
            next: &next,
            refs: &refs,
            clock: &clock,
            v: ENTRY_VERSION,
            key: &key,
            identity: &identity,
            sig: &sig,
        })?;
        Ok(Self {
            id: log_id.to_string(),
            payload,
            next,
            refs,
            clock,
            v: ENTRY_VERSION,
            key,
            identity,
            sig,
            hash: Cid::hash_of(&bytes),
            bytes: bytes.into(),
        })
    }

    /// Parses an entry and recomputes its hash.
    pub fn decode(bytes: impl Into<Bytes>) -> Result<Self, EntryError> {
        let bytes = bytes.into();
        let DecodedEntry {
            id,
            payload,
            next,
            refs,
            clock,
            v,
            key,
            identity,
            sig,
        } = {
            let (decoded, rest) = postcard::take_from_bytes(&bytes)?;
            if !rest.is_empty() {
                return Err(EntryError::TrailingBytes(rest.len()));
            }
            decoded
        };
        Ok(Self {
            id,
            payload,
            next,
            refs,
            clock,
            v,
            key,
            identity,
            sig,
            hash: Cid::hash_of(&bytes),
            bytes,
        })
    }

    /// Checks the signature over the logical fields against the entry `key`.
    pub fn verify(&self, identities: &Identities) -> Result<bool, EntryError> {
        if self.key.is_empty() || self.sig.is_empty() {
            return Ok(false);
        }
        let unsigned = postcard::to_stdvec(&UnsignedEntry {
            id: &self.id,
            payload: &self.payload,
            next: &self.next,
            refs: &self.refs,
            clock: &self.clock,
            v: self.v,
        })?;
        Ok(identities.verify(&self.sig, &self.key, &unsigned))
    }
}

impl<T> Entry<T> {
    /// Id of the log this entry belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Hashes of the direct predecessors.
    pub fn next(&self) -> &[Cid] {
        &self.next
    }

    /// Hashes of additional ancestors, used to skip ahead while traversing.
    pub fn refs(&self) -> &[Cid] {
        &self.refs
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn version(&self) -> u8 {
        self.v
    }

    /// Hex public key of the signer.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Hash of the signer's [`Identity`].
    pub fn identity(&self) -> Cid {
        self.identity
    }

    pub fn sig(&self) -> &str {
        &self.sig
    }

    pub fn hash(&self) -> Cid {
        self.hash
    }

    /// Canonical encoding, the preimage of [`Self::hash`].
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Predecessors followed by refs.
    pub(crate) fn links(&self, use_refs: bool) -> impl Iterator<Item = &Cid> {
        let refs: &[Cid] = if use_refs { &self.refs } else { &[] };
        self.next.iter().chain(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_decode_verify() -> anyhow::Result<()> {
        let identities = Identities::memory();
        let identity = identities.create_identity("userA", None).await?;
        let clock = Clock::new(identity.public_key(), 1);
        let entry = Entry::create(&identity, "log", "hello".to_string(), clock, vec![], vec![])?;
        assert_eq!(entry.version(), ENTRY_VERSION);
        assert_eq!(entry.key(), identity.public_key());
        assert_eq!(entry.identity(), identity.hash());
        assert!(entry.verify(&identities)?);

        let decoded = Entry::<String>::decode(entry.bytes().clone())?;
        assert_eq!(decoded, entry);
        assert_eq!(decoded.payload(), "hello");
        assert_eq!(decoded.clock(), entry.clock());
        assert!(decoded.verify(&identities)?);
        Ok(())
    }

    #[tokio::test]
    async fn tampered_entry_fails_verification() -> anyhow::Result<()> {
        let identities = Identities::memory();
        let identity = identities.create_identity("userA", None).await?;
        let clock = Clock::new(identity.public_key(), 1);
        let entry = Entry::create(&identity, "log", "hello".to_string(), clock.clone(), vec![], vec![])?;
        let other = Entry::create(&identity, "log", "bye".to_string(), clock, vec![], vec![])?;
        let forged = Entry {
            sig: other.sig().to_string(),
            ..entry.clone()
        };
        assert!(!forged.verify(&identities)?);
        assert_ne!(entry.hash(), other.hash());
        Ok(())
    }

    #[tokio::test]
    async fn padded_bytes_are_rejected() -> anyhow::Result<()> {
        let identities = Identities::memory();
        let identity = identities.create_identity("userA", None).await?;
        let clock = Clock::new(identity.public_key(), 1);
        let entry = Entry::create(&identity, "log", "hello".to_string(), clock, vec![], vec![])?;
        let mut padded = entry.bytes().to_vec();
        padded.push(0);
        let err = Entry::<String>::decode(padded).unwrap_err();
        assert!(matches!(err, EntryError::TrailingBytes(1)));
        Ok(())
    }

    #[tokio::test]
    async fn create_requires_log_id() -> anyhow::Result<()> {
        let identities = Identities::memory();
        let identity = identities.create_identity("userA", None).await?;
        let err = Entry::create(&identity, "", 1u32, Clock::new("a", 1), vec![], vec![]).unwrap_err();
        assert!(matches!(err, EntryError::MissingId));
        Ok(())
    }

    #[tokio::test]
    async fn identity_without_key_cannot_sign() -> anyhow::Result<()> {
        let identities = Identities::memory();
        let identity = identities.create_identity("userA", None).await?;
        let remote = identities.get_identity(&identity.hash()).await?.expect("stored");
        let err = Entry::create(&remote, "log", 1u32, Clock::new("a", 1), vec![], vec![]).unwrap_err();
        assert!(matches!(err, EntryError::Sign(IdentityError::MissingKey(_))));
        Ok(())
    }
}

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use super::IdentityError;
use crate::{cid::Cid, keystore};

/// Proofs of key ownership carried by an [`Identity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignatures {
    /// Signature of the identity id by the identity key.
    pub id: String,
    /// Signature of `public_key + signatures.id` by the provider key.
    pub public_key: String,
}

#[derive(Serialize)]
struct EncodeIdentity<'a> {
    id: &'a str,
    public_key: &'a str,
    signatures: &'a IdentitySignatures,
    kind: &'a str,
}

#[derive(Deserialize)]
struct DecodeIdentity {
    id: String,
    public_key: String,
    signatures: IdentitySignatures,
    kind: String,
}

/// A content addressed binding of a public key to signed proofs of control.
///
/// The signing key is attached only to identities created locally and is never encoded.
#[derive(derive_more::Debug, Clone)]
pub struct Identity {
    id: String,
    public_key: String,
    signatures: IdentitySignatures,
    kind: String,
    hash: Cid,
    #[debug(skip)]
    bytes: Bytes,
    #[debug(skip)]
    signing_key: Option<SigningKey>,
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.hash == other.hash
            && self.kind == other.kind
            && self.public_key == other.public_key
            && self.signatures == other.signatures
    }
}

impl Eq for Identity {}

impl Identity {
    /// Assembles and content-addresses an identity.
    pub fn new(
        id: impl Into<String>,
        public_key: impl Into<String>,
        signatures: IdentitySignatures,
        kind: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let (id, public_key, kind) = (id.into(), public_key.into(), kind.into());
        if id.is_empty() {
            return Err(IdentityError::Invalid("identity id is required"));
        }
        if public_key.is_empty() {
            return Err(IdentityError::Invalid("invalid public key"));
        }
        if signatures.id.is_empty() {
            return Err(IdentityError::Invalid("signature of id is required"));
        }
        if signatures.public_key.is_empty() {
            return Err(IdentityError::Invalid("signature of publicKey+id is required"));
        }
        if kind.is_empty() {
            return Err(IdentityError::Invalid("identity type is required"));
        }
        let bytes = postcard::to_stdvec(&EncodeIdentity {
            id: &id,
            public_key: &public_key,
            signatures: &signatures,
            kind: &kind,
        })?;
        Ok(Self {
            hash: Cid::hash_of(&bytes),
            bytes: bytes.into(),
            id,
            public_key,
            signatures,
            kind,
            signing_key: None,
        })
    }

    /// Decodes an identity from its canonical bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, IdentityError> {
        let DecodeIdentity {
            id,
            public_key,
            signatures,
            kind,
        } = match postcard::take_from_bytes(bytes)? {
            (decoded, []) => decoded,
            _ => return Err(IdentityError::Invalid("identity has trailing bytes")),
        };
        Self::new(id, public_key, signatures, kind)
    }

    pub(crate) fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hex encoded ed25519 public key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn signatures(&self) -> &IdentitySignatures {
        &self.signatures
    }

    /// Provider type that created this identity.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn hash(&self) -> Cid {
        self.hash
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Whether this identity can sign, i.e. it was created by the local keystore.
    pub fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Signs `data` with the identity key.
    pub fn sign(&self, data: &[u8]) -> Result<String, IdentityError> {
        let key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| IdentityError::MissingKey(self.id.clone()))?;
        Ok(keystore::sign_message(key, data))
    }

    /// Checks the provider signature over `public_key + signatures.id`.
    pub fn verify_provider_signature(&self) -> bool {
        let data = format!("{}{}", self.public_key, self.signatures.id);
        keystore::verify_message(&self.signatures.public_key, &self.id, data.as_bytes())
    }
}

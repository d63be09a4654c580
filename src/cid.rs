//! A newtype wrapper for a blake3 hash that has a Display and FromStr
//! implementation that conforms to the [cid](https://github.com/multiformats/cid) format.
//!
//! Every entry, identity, manifest and access-control list is stored and referenced by its
//! [`Cid`].
use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// A blake3 content identifier.
///
/// Note that this is not a full cid implementation, it only supports the blake3 hash
/// function and the raw codec.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid([u8; 32]);

const CID_PREFIX: [u8; 4] = [
    0x01, // version
    0x55, // raw codec
    0x1e, // hash function, blake3
    0x20, // hash size, 32 bytes
];

/// Length of the binary form of a [`Cid`].
pub const CID_LEN: usize = 36;

/// Error returned when parsing a [`Cid`] fails.
#[derive(Debug, thiserror::Error)]
pub enum CidError {
    #[error("invalid cid length, expected {CID_LEN}, got {0}")]
    Length(usize),
    #[error("invalid cid prefix")]
    Prefix,
    #[error("invalid multibase encoding, only base32 lower is supported")]
    Multibase,
    #[error("invalid base32")]
    Base32,
}

impl Cid {
    /// Hash `data` with blake3 and wrap the digest as a cid.
    pub fn hash_of(data: impl AsRef<[u8]>) -> Self {
        Cid(*blake3::hash(data.as_ref()).as_bytes())
    }

    /// Wrap a raw blake3 digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Cid(digest)
    }

    /// Get the digest from the cid.
    pub fn digest(&self) -> &[u8; 32] {
        &self.0
    }

    /// Get the cid as bytes.
    pub fn to_bytes(&self) -> [u8; CID_LEN] {
        let mut res = [0u8; CID_LEN];
        res[0..4].copy_from_slice(&CID_PREFIX);
        res[4..CID_LEN].copy_from_slice(&self.0);
        res
    }

    /// Try to create a blake3 cid from cid bytes.
    ///
    /// This will only work if the prefix is the following:
    /// - version 1
    /// - raw codec
    /// - blake3 hash function
    /// - 32 byte hash size
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        if bytes.len() != CID_LEN {
            return Err(CidError::Length(bytes.len()));
        }
        if bytes[0..4] != CID_PREFIX {
            return Err(CidError::Prefix);
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[4..CID_LEN]);
        Ok(Cid(hash))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // data_encoding has no BASE32LOWER_NOPAD const
        let mut encoded = data_encoding::BASE32_NOPAD.encode(&self.to_bytes());
        encoded.make_ascii_lowercase();
        write!(f, "b{encoded}")
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(encoded) = s.strip_prefix('b') else {
            return Err(CidError::Multibase);
        };
        let upper = encoded.to_ascii_uppercase();
        let bytes = data_encoding::BASE32_NOPAD
            .decode(upper.as_bytes())
            .map_err(|_| CidError::Base32)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_bytes(CidVisitor)
        }
    }
}

struct CidVisitor;

impl<'de> de::Visitor<'de> for CidVisitor {
    type Value = Cid;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{CID_LEN} cid bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Cid::from_bytes(v).map_err(E::custom)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut bytes = Vec::with_capacity(CID_LEN);
        while let Some(b) = seq.next_element::<u8>()? {
            bytes.push(b);
        }
        Cid::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_string_roundtrip() {
        let cid = Cid::hash_of(b"hello");
        let s = cid.to_string();
        assert!(s.starts_with('b'));
        assert_eq!(s.len(), 59);
        assert_eq!(s, s.to_ascii_lowercase());
        assert_eq!(s.parse::<Cid>().unwrap(), cid);
    }

    #[test]
    fn cid_rejects_foreign_prefixes() {
        assert!(matches!("zQm123".parse::<Cid>(), Err(CidError::Multibase)));
        let mut bytes = Cid::hash_of(b"x").to_bytes();
        bytes[1] = 0x71;
        assert!(matches!(Cid::from_bytes(&bytes), Err(CidError::Prefix)));
        assert!(matches!(Cid::from_bytes(&bytes[..10]), Err(CidError::Length(10))));
    }

    #[test]
    fn cid_postcard_is_length_prefixed_bytes() {
        let cid = Cid::hash_of(b"entry");
        let encoded = postcard::to_stdvec(&cid).unwrap();
        assert_eq!(encoded[0] as usize, CID_LEN);
        assert_eq!(&encoded[1..], &cid.to_bytes());
        let decoded: Cid = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, cid);
    }
}

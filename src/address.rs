//! Database addresses of the form `/orbitdb/<cid>`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::cid::{Cid, CidError};

/// Protocol prefix of a database address.
pub const ADDRESS_PROTOCOL: &str = "orbitdb";

/// The address of a database: the [`Cid`] of its manifest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(Cid);

/// Error returned when parsing an [`Address`] fails.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("not an {ADDRESS_PROTOCOL} address: {0:?}")]
    Protocol(String),
    #[error("invalid manifest cid: {0}")]
    Cid(#[from] CidError),
}

impl Address {
    pub fn new(manifest: Cid) -> Self {
        Self(manifest)
    }

    /// The manifest hash.
    pub fn cid(&self) -> Cid {
        self.0
    }

    /// Parses `/orbitdb/<cid>` or a bare `<cid>`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        let cid = match s.strip_prefix('/') {
            Some(rest) => {
                let mut parts = rest.splitn(2, '/');
                match (parts.next(), parts.next()) {
                    (Some(ADDRESS_PROTOCOL), Some(cid)) => cid.trim_end_matches('/'),
                    _ => return Err(AddressError::Protocol(s.to_string())),
                }
            }
            None => s,
        };
        Ok(Self(cid.parse()?))
    }

    /// Whether `s` parses as an address.
    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{ADDRESS_PROTOCOL}/{}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_and_bare() {
        let cid = Cid::hash_of(b"manifest");
        let address = Address::new(cid);
        let s = address.to_string();
        assert!(s.starts_with("/orbitdb/b"));
        assert_eq!(Address::parse(&s).unwrap(), address);
        assert_eq!(Address::parse(&cid.to_string()).unwrap(), address);
        assert_eq!(Address::parse(&format!("{s}/")).unwrap(), address);
    }

    #[test]
    fn names_are_not_addresses() {
        assert!(!Address::is_valid("first-database"));
        assert!(!Address::is_valid("/ipfs/bafy"));
        assert!(matches!(
            Address::parse("/ipfs/xyz"),
            Err(AddressError::Protocol(_))
        ));
        assert!(matches!(Address::parse("bnotbase32!"), Err(AddressError::Cid(_))));
    }
}

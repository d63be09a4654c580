//! Access controllers decide which identities may append to a log.
//!
//! Every policy first checks that the writer holds the required capability and then verifies
//! the writer's identity; holding the capability alone is not enough.

use std::{fmt, str::FromStr};

use futures_util::{FutureExt, future::BoxFuture};

use crate::{
    db::DbError,
    identities::{Identities, Identity, IdentityError},
    log::{Entry, Payload},
    storage::StorageError,
};

mod capability;
mod resource;
mod static_list;

pub use self::{
    capability::{ADMIN_CAPABILITY, CapabilityAccess, WRITE_CAPABILITY},
    resource::{ALL_CAPABILITY, DEL_CAPABILITY, PUT_CAPABILITY, ResourceAccess, format_key},
    static_list::StaticAccess,
};

/// Write list entry granting access to everyone.
pub const ANYONE: &str = "*";

/// Errors from access controllers.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("access controller type {0:?} is not supported")]
    UnsupportedType(String),
    #[error("access controller manifest {0} not found")]
    NotFound(String),
    #[error("failed to encode access controller: {0}")]
    Encoding(#[from] postcard::Error),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("access controller database failed: {0}")]
    Database(#[source] Box<DbError>),
}

impl From<DbError> for AccessError {
    fn from(err: DbError) -> Self {
        AccessError::Database(Box::new(err))
    }
}

/// The access controller types that can be named in a manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// A write list fixed at creation.
    #[default]
    Static,
    /// Capabilities granted and revoked at runtime, stored in a key-value database.
    Capability,
    /// `PUT`/`DEL` capabilities per identity and key.
    Resource,
}

impl AccessKind {
    /// The address prefix of the controller type.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKind::Static => "ipfs",
            AccessKind::Capability => "orbitdb",
            AccessKind::Resource => "resource",
        }
    }

    /// Reads the controller type from an address like `/ipfs/<cid>`.
    pub fn from_address(address: &str) -> Result<Self, AccessError> {
        let kind = address
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();
        kind.parse()
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessKind {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipfs" => Ok(AccessKind::Static),
            "orbitdb" => Ok(AccessKind::Capability),
            "resource" => Ok(AccessKind::Resource),
            _ => Err(AccessError::UnsupportedType(s.to_string())),
        }
    }
}

/// How to build the access controller of a new database.
#[derive(Debug, Clone, Default)]
pub struct AccessOptions {
    pub kind: AccessKind,
    /// Initial writers (admins for the dynamic controllers). Defaults to the creator.
    pub write: Option<Vec<String>>,
}

impl AccessOptions {
    pub fn new(kind: AccessKind) -> Self {
        Self { kind, write: None }
    }

    pub fn write(mut self, write: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.write = Some(write.into_iter().map(Into::into).collect());
        self
    }
}

/// The policy guarding a log.
#[derive(Debug, Clone)]
pub enum AccessController {
    /// Accepts every entry. Used for logs that are not shared.
    AllowAll,
    Static(StaticAccess),
    Capability(CapabilityAccess),
    Resource(ResourceAccess),
}

impl AccessController {
    pub fn kind(&self) -> Option<AccessKind> {
        match self {
            AccessController::AllowAll => None,
            AccessController::Static(_) => Some(AccessKind::Static),
            AccessController::Capability(_) => Some(AccessKind::Capability),
            AccessController::Resource(_) => Some(AccessKind::Resource),
        }
    }

    /// The address recorded in the database manifest.
    pub fn address(&self) -> String {
        match self {
            AccessController::AllowAll => ANYONE.to_string(),
            AccessController::Static(access) => access.address().to_string(),
            AccessController::Capability(access) => access.address(),
            AccessController::Resource(access) => access.address(),
        }
    }

    /// Whether the writer of `entry` may append it.
    pub async fn can_append<T: Payload>(&self, entry: &Entry<T>) -> Result<bool, AccessError> {
        match self {
            AccessController::AllowAll => Ok(true),
            AccessController::Static(access) => access.can_append(entry).await,
            AccessController::Capability(access) => access.can_append(entry).await,
            AccessController::Resource(access) => access.can_append(entry).await,
        }
    }

    /// Closes the database backing a dynamic controller.
    pub fn close(&self) -> BoxFuture<'static, Result<(), AccessError>> {
        let this = self.clone();
        async move {
            match this {
                AccessController::Capability(access) => access.close().await,
                AccessController::Resource(access) => access.close().await,
                AccessController::AllowAll | AccessController::Static(_) => Ok(()),
            }
        }
        .boxed()
    }

    /// Removes every grant of a capability controller.
    pub fn drop(&self) -> BoxFuture<'static, Result<(), AccessError>> {
        let this = self.clone();
        async move {
            match this {
                AccessController::Capability(access) => access.drop().await,
                _ => Ok(()),
            }
        }
        .boxed()
    }
}

/// Loads the identity that signed `entry`, if it is known and owns the signing key.
async fn writer<T>(identities: &Identities, entry: &Entry<T>) -> Result<Option<Identity>, AccessError> {
    let identity = identities.get_identity(&entry.identity()).await?;
    Ok(identity.filter(|identity| identity.public_key() == entry.key()))
}

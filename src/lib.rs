//! Peer-to-peer databases replicated through a signed, content addressed operation log.
//!
//! Every database is a [`log::Log`] of operations that peers exchange over a [`net::Node`]
//! substrate: a block store, a pubsub transport and point to point streams. The views in [`db`]
//! replay the log into events, key-value pairs or documents. [`OrbitDb`] opens them by name or
//! [`Address`].
#![deny(rustdoc::broken_intra_doc_links)]

pub mod access;
pub mod address;
pub mod cid;
pub mod config;
pub mod db;
pub mod identities;
pub mod keystore;
pub mod log;
pub mod manifest;
pub mod net;
pub mod orbit;
pub mod storage;
pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use self::{
    address::Address,
    cid::Cid,
    config::Config,
    db::{Database, DbError, DbKind, Documents, Events, KeyValue, KeyValueIndexed},
    orbit::{OpenOptions, OrbitDb, OrbitError, OrbitOptions, Store},
};

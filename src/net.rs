//! Interfaces to the peer-to-peer substrate.
//!
//! The databases never talk to the network directly. They consume three narrow capabilities:
//! a content addressed [`BlockStore`], a topic based [`PubSub`], and point to point byte
//! [`Streams`]. A [`Node`] bundles one of each.

use std::{fmt, str::FromStr, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc},
};

use crate::cid::Cid;

/// Identifier of a peer on the substrate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl From<ed25519_dalek::VerifyingKey> for PeerId {
    fn from(key: ed25519_dalek::VerifyingKey) -> Self {
        PeerId(key.to_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = data_encoding::BASE32_NOPAD.encode(&self.0);
        s.make_ascii_lowercase();
        f.write_str(&s)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::BASE32_NOPAD.decode(s.to_ascii_uppercase().as_bytes())?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid peer id length"))?;
        Ok(PeerId(bytes))
    }
}

/// A content addressed block store.
#[async_trait]
pub trait BlockStore: fmt::Debug + Send + Sync + 'static {
    /// Store a block under its content id.
    async fn put(&self, cid: &Cid, data: Bytes) -> Result<()>;

    /// Fetch a block. Network implementations may wait until the block is found.
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>>;

    /// Keep a block from being garbage collected.
    async fn pin(&self, cid: &Cid) -> Result<()>;
}

/// Events delivered by a [`PubSub`].
#[derive(Debug, Clone)]
pub enum PubSubEvent {
    /// A peer joined or left a topic.
    Subscription {
        peer: PeerId,
        topic: String,
        subscribed: bool,
    },
    /// A message was published on a topic we are subscribed to.
    Message {
        from: PeerId,
        topic: String,
        data: Bytes,
    },
}

/// Topic based publish/subscribe.
#[async_trait]
pub trait PubSub: fmt::Debug + Send + Sync + 'static {
    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()>;

    /// Subscribe to subscription changes and messages of all topics.
    fn events(&self) -> broadcast::Receiver<PubSubEvent>;
}

/// Sending half of a stream.
pub type SendStream = Box<dyn AsyncWrite + Send + Unpin>;
/// Receiving half of a stream.
pub type RecvStream = Box<dyn AsyncRead + Send + Unpin>;

/// A stream opened by a remote peer.
#[derive(derive_more::Debug)]
pub struct IncomingStream {
    pub peer: PeerId,
    #[debug(skip)]
    pub send: SendStream,
    #[debug(skip)]
    pub recv: RecvStream,
}

/// Failure to open a stream.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// The remote peer does not speak the requested protocol.
    #[error("peer does not support protocol {0}")]
    UnsupportedProtocol(String),
    #[error("peer {0} is not reachable")]
    Unreachable(PeerId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Point to point byte streams.
#[async_trait]
pub trait Streams: fmt::Debug + Send + Sync + 'static {
    /// Open a bidirectional stream to `peer` for `protocol`.
    async fn dial(&self, peer: &PeerId, protocol: &str) -> Result<(SendStream, RecvStream), DialError>;

    /// Accept streams for `protocol`. Replaces a previous handler for the same protocol.
    fn handle(&self, protocol: &str) -> Result<mpsc::Receiver<IncomingStream>>;

    /// Stop accepting streams for `protocol`.
    fn unhandle(&self, protocol: &str);
}

/// The substrate capabilities of one local peer.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: PeerId,
    pub blocks: Arc<dyn BlockStore>,
    pub pubsub: Arc<dyn PubSub>,
    pub streams: Arc<dyn Streams>,
}

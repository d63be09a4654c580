//! Internal utilities to support testing.
//!
//! [`MemoryNetwork`] is an in-process substrate: every [`Node`] it hands out shares one block
//! map, one set of pubsub topics and can dial the other nodes over in-memory duplex pipes.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    cid::Cid,
    net::{BlockStore, DialError, IncomingStream, Node, PeerId, PubSub, PubSubEvent, RecvStream, SendStream, Streams},
};

const EVENTS_CAP: usize = 256;
const PIPE_CAP: usize = 64 * 1024;

/// Configures logging for the current test.
///
/// Output is captured by the test harness and only shown for failing tests. `RUST_LOG`
/// overrides the default `DEBUG` level.
#[must_use = "The tracing guard must only be dropped at the end of the test"]
pub fn setup_logging() -> tracing::subscriber::DefaultGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer().with_line_number(true))
        .with(filter)
        .set_default()
}

/// A network of in-memory nodes.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: AtomicU64,
    blocks: Mutex<HashMap<Cid, Bytes>>,
    pinned: Mutex<HashSet<Cid>>,
    stalled: AtomicBool,
    topics: Mutex<BTreeMap<String, BTreeSet<PeerId>>>,
    peers: Mutex<HashMap<PeerId, PeerState>>,
}

#[derive(Debug)]
struct PeerState {
    events: broadcast::Sender<PubSubEvent>,
    handlers: HashMap<String, mpsc::Sender<IncomingStream>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the network.
    pub fn node(&self) -> Node {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = PeerId::from_bytes(*blake3::hash(&n.to_be_bytes()).as_bytes());
        let (events, _) = broadcast::channel(EVENTS_CAP);
        self.inner.peers.lock().insert(
            id,
            PeerState {
                events,
                handlers: HashMap::new(),
            },
        );
        let peer = Arc::new(MemoryPeer {
            id,
            net: self.clone(),
        });
        Node {
            id,
            blocks: peer.clone(),
            pubsub: peer.clone(),
            streams: peer,
        }
    }

    pub fn is_pinned(&self, cid: &Cid) -> bool {
        self.inner.pinned.lock().contains(cid)
    }

    /// While stalled, block reads never complete.
    pub fn stall_blocks(&self, stall: bool) {
        self.inner.stalled.store(stall, Ordering::SeqCst);
    }

    fn notify(&self, peer: &PeerId, event: PubSubEvent) {
        if let Some(state) = self.inner.peers.lock().get(peer) {
            // no receivers is fine
            state.events.send(event).ok();
        }
    }
}

#[derive(Debug)]
struct MemoryPeer {
    id: PeerId,
    net: MemoryNetwork,
}

#[async_trait]
impl BlockStore for MemoryPeer {
    async fn put(&self, cid: &Cid, data: Bytes) -> Result<()> {
        if self.net.inner.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.net.inner.blocks.lock().insert(*cid, data);
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        if self.net.inner.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.net.inner.blocks.lock().get(cid).cloned())
    }

    async fn pin(&self, cid: &Cid) -> Result<()> {
        self.net.inner.pinned.lock().insert(*cid);
        Ok(())
    }
}

#[async_trait]
impl PubSub for MemoryPeer {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        let others: Vec<PeerId> = {
            let mut topics = self.net.inner.topics.lock();
            let subscribers = topics.entry(topic.to_string()).or_default();
            if !subscribers.insert(self.id) {
                return Ok(());
            }
            subscribers.iter().copied().filter(|p| p != &self.id).collect()
        };
        for other in others {
            let change = |peer| PubSubEvent::Subscription {
                peer,
                topic: topic.to_string(),
                subscribed: true,
            };
            self.net.notify(&other, change(self.id));
            self.net.notify(&self.id, change(other));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let others: Vec<PeerId> = {
            let mut topics = self.net.inner.topics.lock();
            let Some(subscribers) = topics.get_mut(topic) else {
                return Ok(());
            };
            if !subscribers.remove(&self.id) {
                return Ok(());
            }
            subscribers.iter().copied().collect()
        };
        for other in others {
            self.net.notify(
                &other,
                PubSubEvent::Subscription {
                    peer: self.id,
                    topic: topic.to_string(),
                    subscribed: false,
                },
            );
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        let others: Vec<PeerId> = self
            .net
            .inner
            .topics
            .lock()
            .get(topic)
            .map(|s| s.iter().copied().filter(|p| p != &self.id).collect())
            .unwrap_or_default();
        for other in others {
            self.net.notify(
                &other,
                PubSubEvent::Message {
                    from: self.id,
                    topic: topic.to_string(),
                    data: data.clone(),
                },
            );
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PubSubEvent> {
        match self.net.inner.peers.lock().get(&self.id) {
            Some(state) => state.events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

#[async_trait]
impl Streams for MemoryPeer {
    async fn dial(&self, peer: &PeerId, protocol: &str) -> Result<(SendStream, RecvStream), DialError> {
        let handler = {
            let peers = self.net.inner.peers.lock();
            let state = peers.get(peer).ok_or(DialError::Unreachable(*peer))?;
            state
                .handlers
                .get(protocol)
                .cloned()
                .ok_or_else(|| DialError::UnsupportedProtocol(protocol.to_string()))?
        };
        let (local, remote) = tokio::io::duplex(PIPE_CAP);
        let (local_recv, local_send) = tokio::io::split(local);
        let (remote_recv, remote_send) = tokio::io::split(remote);
        handler
            .send(IncomingStream {
                peer: self.id,
                send: Box::new(remote_send),
                recv: Box::new(remote_recv),
            })
            .await
            .map_err(|_| DialError::UnsupportedProtocol(protocol.to_string()))?;
        Ok((Box::new(local_send), Box::new(local_recv)))
    }

    fn handle(&self, protocol: &str) -> Result<mpsc::Receiver<IncomingStream>> {
        let (tx, rx) = mpsc::channel(16);
        let mut peers = self.net.inner.peers.lock();
        let state = peers
            .get_mut(&self.id)
            .ok_or_else(|| anyhow::anyhow!("node {} is not part of the network", self.id.fmt_short()))?;
        state.handlers.insert(protocol.to_string(), tx);
        Ok(rx)
    }

    fn unhandle(&self, protocol: &str) {
        if let Some(state) = self.net.inner.peers.lock().get_mut(&self.id) {
            state.handlers.remove(protocol);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn dial_reaches_the_handler() -> Result<()> {
        let net = MemoryNetwork::new();
        let (a, b) = (net.node(), net.node());
        assert!(matches!(
            a.streams.dial(&b.id, "/echo").await,
            Err(DialError::UnsupportedProtocol(_))
        ));

        let mut incoming = b.streams.handle("/echo")?;
        let (mut send, mut recv) = a.streams.dial(&b.id, "/echo").await?;
        let mut stream = incoming.recv().await.expect("incoming stream");
        assert_eq!(stream.peer, a.id);

        send.write_all(b"ping").await?;
        send.shutdown().await?;
        let mut buf = Vec::new();
        stream.recv.read_to_end(&mut buf).await?;
        assert_eq!(buf, b"ping");
        stream.send.write_all(b"pong").await?;
        drop(stream);
        buf.clear();
        recv.read_to_end(&mut buf).await?;
        assert_eq!(buf, b"pong");
        Ok(())
    }

    #[tokio::test]
    async fn subscribers_see_each_other() -> Result<()> {
        let net = MemoryNetwork::new();
        let (a, b) = (net.node(), net.node());
        let mut events_a = a.pubsub.events();
        let mut events_b = b.pubsub.events();
        a.pubsub.subscribe("topic").await?;
        b.pubsub.subscribe("topic").await?;

        let joined = events_a.recv().await?;
        assert!(matches!(joined, PubSubEvent::Subscription { peer, subscribed: true, .. } if peer == b.id));
        let existing = events_b.recv().await?;
        assert!(matches!(existing, PubSubEvent::Subscription { peer, subscribed: true, .. } if peer == a.id));

        b.pubsub.publish("topic", Bytes::from_static(b"hi")).await?;
        let message = events_a.recv().await?;
        assert!(matches!(message, PubSubEvent::Message { from, data, .. } if from == b.id && data == "hi"));
        Ok(())
    }
}

//! Replication of a log between peers.
//!
//! Every database subscribes to a pubsub topic named after its address. When a peer joins the
//! topic we dial it on the heads protocol and both sides exchange their current heads; after
//! that, new local entries are published on the topic. Everything received is handed to the
//! owner as [`SyncEvent`]s over a channel, in arrival order.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
    task::AbortOnDropHandle,
};
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::net::{DialError, IncomingStream, Node, PeerId, PubSubEvent, RecvStream, SendStream};

mod codec;

use self::codec::HeadsCodec;

/// Prefix of the per database heads exchange protocol.
pub const SYNC_PROTOCOL: &str = "/orbitdb/heads";

/// Default budget for dialing a peer and exchanging heads with it.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces the encoded heads to send to a peer.
pub type HeadsSource = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<Bytes>>> + Send + Sync>;

/// What a [`SyncEngine`] reports to its owner.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// An encoded entry received from `from`, either as a head or as a live update.
    Entry { from: PeerId, bytes: Bytes },
    /// The heads exchange with a peer completed.
    Joined(PeerId),
    /// A peer left the topic.
    Left(PeerId),
    /// A peer could not be synced with.
    Error(String),
}

/// Keeps a log in sync with the peers subscribed to its address.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    shared: Arc<Shared>,
    actor: Arc<tokio::sync::Mutex<Option<ActorHandle>>>,
}

#[derive(derive_more::Debug)]
struct Shared {
    node: Node,
    address: String,
    protocol: String,
    timeout: Duration,
    #[debug(skip)]
    heads: HeadsSource,
    events: mpsc::Sender<SyncEvent>,
    peers: Mutex<BTreeSet<PeerId>>,
}

#[derive(Debug)]
struct ActorHandle {
    cancel: CancellationToken,
    task: AbortOnDropHandle<()>,
}

impl SyncEngine {
    /// Creates a stopped engine for the log at `address`.
    pub fn new(
        node: Node,
        address: impl Into<String>,
        heads: HeadsSource,
        events: mpsc::Sender<SyncEvent>,
        timeout: Duration,
    ) -> Self {
        let address = address.into();
        Self {
            shared: Arc::new(Shared {
                node,
                protocol: format!("{SYNC_PROTOCOL}{address}"),
                address,
                timeout,
                heads,
                events,
                peers: Default::default(),
            }),
            actor: Default::default(),
        }
    }

    /// The pubsub topic, equal to the database address.
    pub fn topic(&self) -> &str {
        &self.shared.address
    }

    /// The stream protocol used for heads exchange.
    pub fn protocol(&self) -> &str {
        &self.shared.protocol
    }

    pub async fn is_started(&self) -> bool {
        self.actor.lock().await.is_some()
    }

    /// Starts accepting heads exchanges and subscribes to the topic.
    pub async fn start(&self) -> Result<()> {
        let mut actor = self.actor.lock().await;
        if actor.is_some() {
            return Ok(());
        }
        let node = &self.shared.node;
        let incoming = node.streams.handle(&self.shared.protocol)?;
        // listen before subscribing so the notifications about existing subscribers are seen
        let pubsub = node.pubsub.events();
        if let Err(err) = node.pubsub.subscribe(&self.shared.address).await {
            node.streams.unhandle(&self.shared.protocol);
            return Err(err);
        }
        let cancel = CancellationToken::new();
        let span = error_span!("sync", me = %node.id.fmt_short(), topic = %self.shared.address);
        let task = tokio::spawn(
            Actor {
                shared: self.shared.clone(),
                exchanges: JoinSet::new(),
            }
            .run(incoming, pubsub, cancel.clone())
            .instrument(span),
        );
        *actor = Some(ActorHandle {
            cancel,
            task: AbortOnDropHandle::new(task),
        });
        debug!(topic = %self.shared.address, "sync started");
        Ok(())
    }

    /// Stops syncing, waiting for the event in progress to be handled.
    ///
    /// Heads exchanges still running are aborted.
    pub async fn stop(&self) -> Result<()> {
        let Some(handle) = self.actor.lock().await.take() else {
            return Ok(());
        };
        handle.cancel.cancel();
        if let Err(err) = handle.task.await {
            if !err.is_cancelled() {
                warn!(?err, "sync actor failed");
            }
        }
        let node = &self.shared.node;
        node.streams.unhandle(&self.shared.protocol);
        node.pubsub.unsubscribe(&self.shared.address).await?;
        self.shared.peers.lock().clear();
        debug!(topic = %self.shared.address, "sync stopped");
        Ok(())
    }

    /// Publishes an encoded entry to the peers on the topic. Does nothing while stopped.
    pub async fn add(&self, entry: Bytes) -> Result<()> {
        if !self.is_started().await {
            return Ok(());
        }
        self.shared
            .node
            .pubsub
            .publish(&self.shared.address, entry)
            .await
            .context("failed to publish entry")
    }

    /// Peers we are currently syncing with.
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.peers.lock().iter().copied().collect()
    }
}

struct Actor {
    shared: Arc<Shared>,
    exchanges: JoinSet<()>,
}

impl Actor {
    async fn run(
        mut self,
        mut incoming: mpsc::Receiver<IncomingStream>,
        mut pubsub: broadcast::Receiver<PubSubEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(stream) = incoming.recv() => {
                    let IncomingStream { peer, send, recv } = stream;
                    trace!(peer = %peer.fmt_short(), "accepted heads exchange");
                    self.shared.peers.lock().insert(peer);
                    let shared = self.shared.clone();
                    self.exchanges.spawn(async move { shared.exchange(peer, send, recv).await });
                }
                event = pubsub.recv() => match event {
                    Ok(event) => self.on_pubsub_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "pubsub events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(res) = self.exchanges.join_next(), if !self.exchanges.is_empty() => {
                    if let Err(err) = res {
                        if !err.is_cancelled() {
                            warn!(?err, "heads exchange task failed");
                        }
                    }
                }
            }
        }
        self.exchanges.shutdown().await;
    }

    async fn on_pubsub_event(&mut self, event: PubSubEvent) {
        match event {
            PubSubEvent::Subscription {
                peer,
                topic,
                subscribed,
            } if topic == self.shared.address => {
                if subscribed {
                    if !self.shared.peers.lock().insert(peer) {
                        return;
                    }
                    let shared = self.shared.clone();
                    self.exchanges.spawn(async move { shared.dial(peer).await });
                } else {
                    self.shared.peers.lock().remove(&peer);
                    debug!(peer = %peer.fmt_short(), "peer left");
                    self.shared.emit(SyncEvent::Left(peer)).await;
                }
            }
            PubSubEvent::Message { from, topic, data } if topic == self.shared.address => {
                if from == self.shared.node.id {
                    return;
                }
                trace!(from = %from.fmt_short(), len = data.len(), "received update");
                self.shared.emit(SyncEvent::Entry { from, bytes: data }).await;
            }
            _ => {}
        }
    }
}

impl Shared {
    async fn emit(&self, event: SyncEvent) {
        // the receiver is gone once the database closed
        self.events.send(event).await.ok();
    }

    async fn dial(self: Arc<Self>, peer: PeerId) {
        let dial = tokio::time::timeout(self.timeout, self.node.streams.dial(&peer, &self.protocol)).await;
        let (send, recv) = match dial {
            Ok(Ok(streams)) => streams,
            Ok(Err(DialError::UnsupportedProtocol(protocol))) => {
                debug!(peer = %peer.fmt_short(), %protocol, "peer does not sync this database");
                self.peers.lock().remove(&peer);
                return;
            }
            Ok(Err(err)) => {
                self.peers.lock().remove(&peer);
                self.emit(SyncEvent::Error(format!("failed to dial {}: {err}", peer.fmt_short())))
                    .await;
                return;
            }
            Err(_) => {
                self.peers.lock().remove(&peer);
                self.emit(SyncEvent::Error(format!(
                    "dialing {} timed out after {:?}",
                    peer.fmt_short(),
                    self.timeout
                )))
                .await;
                return;
            }
        };
        self.exchange(peer, send, recv).await
    }

    async fn exchange(&self, peer: PeerId, send: SendStream, recv: RecvStream) {
        let res = tokio::time::timeout(self.timeout, self.exchange_heads(peer, send, recv)).await;
        match res {
            Ok(Ok(received)) => {
                debug!(peer = %peer.fmt_short(), received, "exchanged heads");
                self.emit(SyncEvent::Joined(peer)).await;
            }
            Ok(Err(err)) => {
                self.peers.lock().remove(&peer);
                self.emit(SyncEvent::Error(format!(
                    "heads exchange with {} failed: {err:#}",
                    peer.fmt_short()
                )))
                .await;
            }
            Err(_) => {
                self.peers.lock().remove(&peer);
                self.emit(SyncEvent::Error(format!(
                    "heads exchange with {} timed out",
                    peer.fmt_short()
                )))
                .await;
            }
        }
    }

    /// Sends our heads while receiving theirs. Returns the number of heads received.
    async fn exchange_heads(&self, peer: PeerId, send: SendStream, recv: RecvStream) -> Result<usize> {
        let heads = (self.heads)().await?;
        let send_heads = async move {
            let mut writer = FramedWrite::new(send, HeadsCodec);
            for head in heads {
                writer.send(head).await?;
            }
            writer.close().await?;
            anyhow::Ok(())
        };
        let recv_heads = async {
            let mut reader = FramedRead::new(recv, HeadsCodec);
            let mut received = 0;
            while let Some(head) = reader.next().await {
                self.emit(SyncEvent::Entry {
                    from: peer,
                    bytes: head?,
                })
                .await;
                received += 1;
            }
            anyhow::Ok(received)
        };
        let ((), received) = tokio::try_join!(send_heads, recv_heads)?;
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::test_utils::MemoryNetwork;

    fn heads(items: &'static [&'static [u8]]) -> HeadsSource {
        Arc::new(move || Box::pin(async move { Ok(items.iter().map(|b| Bytes::from_static(b)).collect()) }))
    }

    fn engine(node: Node, items: &'static [&'static [u8]]) -> (SyncEngine, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (SyncEngine::new(node, "/orbitdb/test", heads(items), tx, DEFAULT_SYNC_TIMEOUT), rx)
    }

    /// Collects events until `peer` is reported as joined.
    async fn until_joined(rx: &mut mpsc::Receiver<SyncEvent>, peer: PeerId) -> Vec<Bytes> {
        let mut entries = Vec::new();
        loop {
            match rx.recv().await.expect("sync events") {
                SyncEvent::Entry { from, bytes } => {
                    assert_eq!(from, peer);
                    entries.push(bytes);
                }
                SyncEvent::Joined(p) if p == peer => return entries,
                SyncEvent::Error(err) => panic!("unexpected error: {err}"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn peers_exchange_heads_on_join() -> Result<()> {
        let net = MemoryNetwork::new();
        let (node_a, node_b) = (net.node(), net.node());
        let (a, mut rx_a) = engine(node_a.clone(), &[b"a1", b"a2"]);
        let (b, mut rx_b) = engine(node_b.clone(), &[b"b1"]);
        a.start().await?;
        b.start().await?;

        let mut from_b = until_joined(&mut rx_a, node_b.id).await;
        let mut from_a = until_joined(&mut rx_b, node_a.id).await;
        // both sides may dial at once, so heads can arrive twice
        from_a.sort();
        from_a.dedup();
        from_b.sort();
        from_b.dedup();
        assert_eq!(from_a, [Bytes::from_static(b"a1"), Bytes::from_static(b"a2")]);
        assert_eq!(from_b, [Bytes::from_static(b"b1")]);
        assert_eq!(a.peers(), [node_b.id]);
        assert_eq!(b.peers(), [node_a.id]);

        // live updates travel over the topic
        a.add(Bytes::from_static(b"a3")).await?;
        loop {
            if let SyncEvent::Entry { bytes, .. } = rx_b.recv().await.expect("sync events") {
                if bytes == Bytes::from_static(b"a3") {
                    break;
                }
            }
        }

        b.stop().await?;
        loop {
            if let SyncEvent::Left(peer) = rx_a.recv().await.expect("sync events") {
                assert_eq!(peer, node_b.id);
                break;
            }
        }
        assert!(a.peers().is_empty());
        a.stop().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn peers_without_the_protocol_are_skipped() -> Result<()> {
        let net = MemoryNetwork::new();
        let node_a = net.node();
        let bystander = net.node();
        let (a, mut rx_a) = engine(node_a, &[b"a1"]);
        a.start().await?;
        // subscribed to the topic but not serving heads
        bystander.pubsub.subscribe("/orbitdb/test").await?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.peers().is_empty());
        assert!(rx_a.try_recv().is_err());
        a.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn add_while_stopped_is_a_noop() -> Result<()> {
        let net = MemoryNetwork::new();
        let (a, _rx) = engine(net.node(), &[]);
        a.add(Bytes::from_static(b"ignored")).await?;
        assert!(!a.is_started().await);
        assert_eq!(a.protocol(), "/orbitdb/heads/orbitdb/test");
        Ok(())
    }
}

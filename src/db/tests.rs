use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use tracing_test::traced_test;

use super::*;
use crate::test_utils::MemoryNetwork;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Options for a database at the address derived from `name`.
pub(crate) fn options<T: Value>(
    node: Node,
    identities: Identities,
    identity: Identity,
    name: &str,
    access: AccessController,
) -> DatabaseOptions<T> {
    let address = Address::new(Cid::hash_of(name));
    let mut options = DatabaseOptions::new(node, identity, identities, address, access);
    options.name = name.to_string();
    options.kind = DbKind::KeyValue;
    options
}

pub(crate) async fn open_db_on<T: Value>(
    node: Node,
    identities: Identities,
    identity: Identity,
    name: &str,
    access: AccessController,
) -> Result<Database<T>> {
    Ok(Database::open(options(node, identities, identity, name, access)).await?)
}

/// Opens a database that anyone may write to, on a fresh network.
pub(crate) async fn open_db<T: Value>(name: &str) -> Result<(MemoryNetwork, Database<T>)> {
    let net = MemoryNetwork::new();
    let identities = Identities::memory();
    let identity = identities.create_identity("userA", None).await?;
    let db = open_db_on(net.node(), identities, identity, name, AccessController::AllowAll).await?;
    Ok((net, db))
}

async fn next_update<T: Value>(events: &mut broadcast::Receiver<DatabaseEvent<T>>) -> Result<DbEntry<T>> {
    loop {
        if let DatabaseEvent::Update(entry) = events.recv().await? {
            return Ok(entry);
        }
    }
}

#[tokio::test]
#[traced_test]
async fn replicates_between_peers() -> Result<()> {
    let net = MemoryNetwork::new();
    let (node_a, node_b) = (net.node(), net.node());
    let ids_a = Identities::memory();
    let ids_b = Identities::memory();
    let user_a = ids_a.create_identity("userA", None).await?;
    let user_b = ids_b.create_identity("userB", None).await?;

    let a: Database<String> = open_db_on(node_a.clone(), ids_a, user_a, "replicated", AccessController::AllowAll).await?;
    let before = a.add_operation(Operation::put("k1", "v1".to_string())).await?;

    let mut options = options(node_b, ids_b, user_b, "replicated", AccessController::AllowAll);
    options.config.sync_automatically = false;
    let b = Database::<String>::open(options).await?;
    let mut events = b.events();
    b.sync().start().await?;

    // heads sent on join
    let joined = tokio::time::timeout(TIMEOUT, async {
        let mut updated = false;
        loop {
            match events.recv().await? {
                DatabaseEvent::Update(entry) => {
                    assert_eq!(entry.hash(), before);
                    updated = true;
                }
                DatabaseEvent::Join { peer, heads } if updated => return anyhow::Ok((peer, heads)),
                _ => {}
            }
        }
    })
    .await
    .context("join timed out")??;
    assert_eq!(joined.0, node_a.id);
    assert_eq!(joined.1.len(), 1);
    assert_eq!(b.peers(), [node_a.id]);

    // live updates
    let after = a.add_operation(Operation::put("k2", "v2".to_string())).await?;
    let entry = tokio::time::timeout(TIMEOUT, next_update(&mut events)).await??;
    assert_eq!(entry.hash(), after);
    assert_eq!(entry.next(), [before]);

    let ours: Vec<_> = b.log().values().await?.iter().map(|e| e.hash()).collect();
    let theirs: Vec<_> = a.log().values().await?.iter().map(|e| e.hash()).collect();
    assert_eq!(ours, theirs);

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn invalid_entries_from_peers_are_reported() -> Result<()> {
    let (net, db) = open_db::<String>("guarded").await?;
    let mut events = db.events();
    let peer = net.node();
    peer.pubsub.subscribe(db.sync().topic()).await?;
    peer.pubsub
        .publish(db.sync().topic(), Bytes::from_static(b"not an entry"))
        .await?;

    let err = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let DatabaseEvent::Error(err) = events.recv().await? {
                return anyhow::Ok(err);
            }
        }
    })
    .await??;
    assert!(!err.is_empty());
    assert!(db.log().heads().await?.is_empty());
    assert!(!db.is_closed());
    Ok(())
}

#[tokio::test]
async fn close_runs_hooks_once() -> Result<()> {
    let (_net, db) = open_db::<String>("closing").await?;
    let mut events = db.events();
    let closed = Arc::new(AtomicUsize::new(0));
    db.on_close({
        let closed = closed.clone();
        move || {
            closed.fetch_add(1, Ordering::SeqCst);
        }
    });

    db.close().await?;
    db.close().await?;
    assert!(db.is_closed());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(matches!(events.recv().await?, DatabaseEvent::Close));
    assert!(matches!(
        db.add_operation(Operation::add("late".to_string())).await,
        Err(DbError::Closed)
    ));
    assert!(!db.sync().is_started().await);
    Ok(())
}

#[tokio::test]
async fn drop_clears_the_log() -> Result<()> {
    let (_net, db) = open_db::<u64>("dropping").await?;
    for i in 0..3 {
        db.add_operation(Operation::add(i)).await?;
    }
    let mut events = db.events();
    db.drop().await?;
    assert!(matches!(events.recv().await?, DatabaseEvent::Drop));
    assert!(db.log().values().await?.is_empty());
    assert!(db.log().heads().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn update_hook_runs_before_the_event() -> Result<()> {
    let net = MemoryNetwork::new();
    let identities = Identities::memory();
    let identity = identities.create_identity("userA", None).await?;
    let seen = Arc::new(AtomicUsize::new(0));
    let mut options = options::<String>(net.node(), identities, identity, "hooked", AccessController::AllowAll);
    options.on_update = Some({
        let seen = seen.clone();
        Arc::new(move |_log: Log<Operation<String>>, _entry: DbEntry<String>| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DbError>(())
            }
            .boxed()
        })
    });
    let db = Database::open(options).await?;
    let mut events = db.events();
    let hash = db.add_operation(Operation::put("k", "v".to_string())).await?;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(next_update(&mut events).await?.hash(), hash);
    Ok(())
}

#[test]
fn kinds_parse() {
    for kind in [DbKind::Events, DbKind::KeyValue, DbKind::Documents, DbKind::KeyValueIndexed] {
        assert_eq!(kind.to_string().parse::<DbKind>().unwrap(), kind);
    }
    assert!(matches!("counter".parse::<DbKind>(), Err(DbError::UnsupportedKind(_))));
}

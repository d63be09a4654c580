//! Hashes of entries must never change for the same key-pair and operation.
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use iroh_orbit::{
    db::{Op, Operation},
    identities::{Identities, Identity},
    keystore::{self, KeyStore},
    log::{Clock, Entry, Log, LogOptions},
    storage::MemoryStorage,
};

const IDENTITY_HASH: &str = "bafkr4ifn53ayp535kwj5v7euujcccg2tq7svurwzlatvwct2tqo2lryx7i";
const ENTRY_HASH: &str = "bafkr4idizugnhhu35jlm4wmgg4fyssfeell5pfozz2otynlj2taswiukye";

async fn fixed_identity() -> anyhow::Result<(Identities, Identity)> {
    let seed: [u8; 32] = std::array::from_fn(|i| i as u8);
    let key = SigningKey::from_bytes(&seed);
    let keystore = KeyStore::memory();
    keystore.add_key("userA", &key).await?;
    keystore.add_key(&keystore::public_key_hex(&key), &key).await?;
    let identities = Identities::new(keystore, Arc::new(MemoryStorage::new()));
    let identity = identities.create_identity("userA", None).await?;
    Ok((identities, identity))
}

#[tokio::test]
async fn identity_hash_is_stable() -> anyhow::Result<()> {
    let (identities, identity) = fixed_identity().await?;
    assert_eq!(identity.hash().to_string(), IDENTITY_HASH);
    assert!(identities.verify_identity(&identity));
    Ok(())
}

#[tokio::test]
async fn entry_hash_is_stable() -> anyhow::Result<()> {
    let (identities, identity) = fixed_identity().await?;
    let payload = Operation::put("1", "record 1 on db 1".to_string());

    let entry = Entry::create(
        &identity,
        "A",
        payload.clone(),
        Clock::new(identity.public_key(), 1),
        Vec::new(),
        Vec::new(),
    )?;
    assert_eq!(entry.hash().to_string(), ENTRY_HASH);
    assert!(entry.verify(&identities)?);

    // appending through a log produces the same entry
    let log = Log::open(
        identity,
        identities,
        LogOptions {
            id: Some("A".to_string()),
            ..Default::default()
        },
    )
    .await?;
    let appended = log.append(payload, 0).await?;
    assert_eq!(appended.hash().to_string(), ENTRY_HASH);
    assert_eq!(appended.payload().op, Op::Put);

    let decoded = Entry::<Operation<String>>::decode(appended.bytes().clone())?;
    assert_eq!(decoded.hash(), appended.hash());
    Ok(())
}

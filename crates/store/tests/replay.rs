#![forbid(unsafe_code)]

use std::sync::Arc;

use vicinity_core::{Coordinate, Entity, EntityId, GeoKey, Tier};
use vicinity_store::{spawn_ingest, Delta, GeoStore, MemoryStore};

fn id(s: &str) -> EntityId {
    EntityId::parse(s).unwrap()
}

fn key(lat: f64, lng: f64) -> GeoKey {
    GeoKey::new(Coordinate::new(lat, lng).unwrap()).unwrap()
}

#[test]
fn replay_basic_sequence() {
    let store = MemoryStore::with_entities([Entity::new(id("a")).with_tier(Tier(2)).with_credits(3)]);

    // First batch: a gets a location, b appears for the first time.
    store
        .apply_batch(vec![
            Delta::Located { id: id("a"), location: key(52.52, 13.405) },
            Delta::Located { id: id("b"), location: key(48.85, 2.35) },
        ])
        .unwrap();
    let snap1 = store.snapshot();
    assert_eq!(snap1.epoch, 2);
    assert_eq!(snap1.len(), 2);
    let a = snap1.get(&id("a")).unwrap();
    assert_eq!(a.tier, Tier(2));
    assert_eq!(a.credits, 3);
    assert_eq!(a.location.as_ref().map(|l| &l.hash()[..3]), Some("u33"));

    // Second batch: a moves, b leaves.
    store
        .apply_batch(vec![Delta::Located { id: id("a"), location: key(-33.86, 151.2) }, Delta::Removed(id("b"))])
        .unwrap();
    let snap2 = store.snapshot();
    assert_eq!(snap2.epoch, 3);
    assert_eq!(snap2.len(), 1);
    assert_eq!(snap2.range("u33", "u33~").count(), 0);
    assert_eq!(snap2.range("r", "r~").count(), 1);
}

async fn run_sequence(seq: &[Delta]) -> Vec<(String, String)> {
    let store = Arc::new(MemoryStore::new());
    let (tx, ingest) = spawn_ingest(Arc::clone(&store), 128);
    for d in seq.iter().cloned() {
        let _ = tx.send(d).await;
    }
    drop(tx);
    ingest.join().await;
    let mut canon: Vec<(String, String)> = store
        .range_query("0", "z~", &[], None)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.id.to_string(), e.location.map(|l| l.hash().to_string()).unwrap_or_default()))
        .collect();
    canon.sort_unstable();
    canon
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingest_is_deterministic_across_runs() {
    let seq = vec![
        Delta::Located { id: id("a"), location: key(52.5200, 13.4050) },
        Delta::Located { id: id("b"), location: key(52.5210, 13.4060) },
        Delta::Located { id: id("c"), location: key(52.6000, 13.9000) },
        // rapid movement of b; only the last position matters
        Delta::Located { id: id("b"), location: key(52.5211, 13.4061) },
        Delta::Located { id: id("b"), location: key(52.5212, 13.4062) },
        Delta::Removed(id("c")),
        Delta::Located { id: id("d"), location: key(40.7128, -74.0060) },
    ];
    let first = run_sequence(&seq).await;
    for _ in 0..5 {
        assert_eq!(run_sequence(&seq).await, first);
    }
    let ids: Vec<_> = first.iter().map(|(i, _)| i.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "d"]);
    let b_hash = &first[1].1;
    assert_eq!(b_hash, key(52.5212, 13.4062).hash());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingest_bumps_epoch_for_watchers() {
    let store = Arc::new(MemoryStore::new());
    let mut rx = store.subscribe_epoch();
    let (tx, ingest) = spawn_ingest(Arc::clone(&store), 16);
    tx.send(Delta::Located { id: id("a"), location: key(1.0, 1.0) }).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(2), rx.changed()).await.unwrap().unwrap();
    assert!(*rx.borrow() >= 1);
    drop(tx);
    ingest.join().await;
    assert_eq!(store.len(), 1);
}

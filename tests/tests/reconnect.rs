mod common;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use common::*;
use orchestra::{
    error::ConsistencyError,
    proto::Decision,
    storage::{memory::MemoryUpdateStore, UpdateLog},
    ReconcileError,
};
use orchestra_storage_sled::SledUpdateStore;

#[tokio::test]
async fn test_replay_reproduces_recorded_rounds() -> Result<()> {
    let store = MemoryUpdateStore::new();
    let q = Quartet::new(|name| Ok(memory_peer(&store, name))).await?;
    q.up_to_conflict().await?;
    q.b.resolve(&BTreeMap::from([(3, BTreeMap::from([(0, Some(0))]))])).await?;

    let outcomes = q.b.replay_on_reconnect().await?;
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[2].accepted(), BTreeSet::from([tid(2, "A")]));
    assert_eq!(q.b.get(&key(1)).await?, Some(r(1, "z")));
    Ok(())
}

#[tokio::test]
async fn test_tampered_log_is_detected() -> Result<()> {
    let store = MemoryUpdateStore::new();
    let q = Quartet::new(|name| Ok(memory_peer(&store, name))).await?;
    q.a.publish(insert(1, "x")).await?;
    q.b.reconcile().await?;

    // a decision the round never made
    store.log("B").record_decisions(1, &[Decision::accept(tid(1, "C"), 1)]).await?;
    let replayed = q.b.replay_on_reconnect().await;
    assert!(matches!(replayed, Err(ReconcileError::Consistency(ConsistencyError::ReplayDiverged { recno: 1, .. }))));
    Ok(())
}

#[tokio::test]
async fn test_lost_replica_is_a_round_mismatch() -> Result<()> {
    let store = MemoryUpdateStore::new();
    let q = Quartet::new(|name| Ok(memory_peer(&store, name))).await?;
    q.a.publish(insert(1, "x")).await?;
    q.b.reconcile().await?;

    let restarted = memory_peer(&store, "B");
    assert!(matches!(restarted.replay_on_reconnect().await, Err(ReconcileError::Consistency(ConsistencyError::RoundMismatch { log: 1, state: 0 }))));
    assert!(matches!(restarted.reconcile().await, Err(ReconcileError::Consistency(_))));
    Ok(())
}

/// Trust granted after a round does not change how that round is replayed
#[tokio::test]
async fn test_replay_uses_the_trust_each_round_ran_under() -> Result<()> {
    let store = MemoryUpdateStore::new();
    let q = Quartet::new(|name| Ok(memory_peer(&store, name))).await?;
    q.c.publish(insert(2, "c")).await?;
    assert!(q.b.reconcile().await?.decisions.is_empty());

    q.b.add_trust_condition("C", "R", 3, None).await?;
    assert_eq!(q.b.reconcile().await?.decisions, vec![Decision::accept(tid(1, "C"), 2)]);

    let outcomes = q.b.replay_on_reconnect().await?;
    assert!(outcomes[0].decisions.is_empty());
    assert_eq!(outcomes[1].accepted(), BTreeSet::from([tid(1, "C")]));
    Ok(())
}

/// Resolving a conflict reruns its round as it first ran, and new trust only applies to rounds after it
#[tokio::test]
async fn test_resolution_keeps_recorded_trust() -> Result<()> {
    let store = MemoryUpdateStore::new();
    let q = Quartet::new(|name| Ok(memory_peer(&store, name))).await?;
    q.up_to_conflict().await?;
    q.b.add_trust_condition("C", "R", 3, None).await?;

    let outcomes = q.b.resolve(&BTreeMap::from([(3, BTreeMap::from([(0, Some(0))]))])).await?;
    assert_eq!(outcomes[0].decisions, vec![Decision::accept(tid(2, "A"), 3), Decision::reject(tid(1, "D"), 3)]);
    assert_eq!(q.b.replay_on_reconnect().await?.len(), 3);

    // C's insert collides with the value B now holds
    assert_eq!(q.b.reconcile().await?.decisions, vec![Decision::reject(tid(1, "C"), 4)]);
    Ok(())
}

/// A restarted peer picks up its durable log and replica, and can still settle conflicts from before the restart
#[tokio::test]
async fn test_restart_over_sled() -> Result<()> {
    let store = SledUpdateStore::new_test()?;
    {
        let q = Quartet::new(|name| sled_peer(&store, name)).await?;
        q.up_to_conflict().await?;
    }

    // no trust configured yet: replay and resolution use the trust each round recorded
    let b = sled_peer(&store, "B")?;
    assert!(b.conflicts(3).await.is_none());

    let outcomes = b.replay_on_reconnect().await?;
    assert_eq!(outcomes.len(), 3);
    assert_eq!(b.conflicts(3).await.map(|c| c.len()), Some(1));
    assert_eq!(b.get(&key(1)).await?, Some(r(1, "x")));

    b.resolve(&BTreeMap::from([(3, BTreeMap::from([(0, Some(1))]))])).await?;
    assert_eq!(b.get(&key(1)).await?, Some(r(1, "w")));
    assert_eq!(
        store.log("B")?.decisions_at(3).await?,
        vec![Decision::accept(tid(1, "D"), 3), Decision::reject(tid(2, "A"), 3)]
    );
    Ok(())
}

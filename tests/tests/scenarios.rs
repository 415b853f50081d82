mod common;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use common::*;
use orchestra::{
    conflict::ConflictKind,
    proto::Decision,
    proto::tuple,
    storage::{memory::MemoryUpdateStore, UpdateLog},
    Change, ReconcileError, TxnStatus,
};

async fn quartet() -> Result<(MemoryUpdateStore, Quartet)> {
    let store = MemoryUpdateStore::new();
    let quartet = Quartet::new(|name| Ok(memory_peer(&store, name))).await?;
    Ok((store, quartet))
}

#[tokio::test]
async fn test_trusted_insert_is_accepted() -> Result<()> {
    let (_store, q) = quartet().await?;

    let t1 = q.a.publish(insert(1, "x")).await?;
    assert_eq!(t1.id, tid(1, "A"));

    let outcome = q.b.reconcile().await?;
    assert_eq!(outcome.recno, 1);
    assert_eq!(outcome.decisions, vec![Decision::accept(tid(1, "A"), 1)]);
    assert_eq!(q.b.get(&key(1)).await?, Some(r(1, "x")));
    assert_eq!(q.b.current_round().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_untrusted_insert_gets_no_decision() -> Result<()> {
    let (_store, q) = quartet().await?;
    q.a.publish(insert(1, "x")).await?;
    q.b.reconcile().await?;

    q.c.publish(insert(1, "y")).await?;
    let outcome = q.b.reconcile().await?;

    assert!(outcome.decisions.is_empty());
    assert!(outcome.statuses.is_empty());
    assert!(outcome.conflicts.is_empty());
    assert_eq!(q.b.dump().await?, vec![r(1, "x")]);
    Ok(())
}

#[tokio::test]
async fn test_equal_priority_update_conflict_is_deferred() -> Result<()> {
    let (_store, q) = quartet().await?;
    q.up_to_conflict().await?;

    let outcome = q.b.outcome(3).await.expect("round 3 ran");
    assert!(outcome.decisions.is_empty());
    assert_eq!(outcome.statuses.get(&tid(2, "A")), Some(&TxnStatus::DeferConflict));
    assert_eq!(outcome.statuses.get(&tid(1, "D")), Some(&TxnStatus::DeferConflict));

    let conflicts = q.b.conflicts(3).await.expect("round 3 ran");
    assert_eq!(conflicts.len(), 1);
    let conflict = conflicts.get(0).unwrap();
    assert_eq!(conflict.kind(), ConflictKind::Update);
    let options: Vec<_> = conflict.options.iter().map(|o| o.update.new_value().cloned()).collect();
    assert_eq!(options, vec![Some(r(1, "z")), Some(r(1, "w"))]);

    // still waiting in the next round
    let outcome = q.b.reconcile().await?;
    assert!(outcome.decisions.is_empty());
    assert_eq!(outcome.statuses.get(&tid(2, "A")), Some(&TxnStatus::Defer));
    assert_eq!(q.b.get(&key(1)).await?, Some(r(1, "x")));
    Ok(())
}

#[tokio::test]
async fn test_resolution_keeps_the_chosen_option() -> Result<()> {
    let (store, q) = quartet().await?;
    q.up_to_conflict().await?;
    q.b.reconcile().await?;

    let outcomes = q.b.resolve(&BTreeMap::from([(3, BTreeMap::from([(0, Some(0))]))])).await?;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].decisions, vec![Decision::accept(tid(2, "A"), 3), Decision::reject(tid(1, "D"), 3)]);
    assert!(outcomes[1].decisions.is_empty());

    assert_eq!(q.b.get(&key(1)).await?, Some(r(1, "z")));
    assert_eq!(q.b.current_round().await?, 4);
    assert_eq!(store.log("B").decisions_at(3).await?, vec![Decision::accept(tid(2, "A"), 3), Decision::reject(tid(1, "D"), 3)]);
    assert_eq!(store.log("B").accepted_at(3).await?.into_keys().collect::<BTreeSet<_>>(), BTreeSet::from([tid(2, "A")]));
    assert!(q.b.conflicts(3).await.is_some_and(|c| c.is_empty()));

    // D builds on its rejected transaction, which drags the new one down too
    q.d.publish(modify(1, "w", "v")).await?;
    let outcome = q.b.reconcile().await?;
    assert_eq!(outcome.decisions, vec![Decision::reject(tid(2, "D"), 5)]);
    Ok(())
}

#[tokio::test]
async fn test_rejecting_every_option() -> Result<()> {
    let (_store, q) = quartet().await?;
    q.up_to_conflict().await?;

    let outcomes = q.b.resolve(&BTreeMap::from([(3, BTreeMap::from([(0, None)]))])).await?;
    assert_eq!(outcomes[0].decisions, vec![Decision::reject(tid(1, "D"), 3), Decision::reject(tid(2, "A"), 3)]);
    assert_eq!(q.b.get(&key(1)).await?, Some(r(1, "x")));
    Ok(())
}

#[tokio::test]
async fn test_local_edits_survive_resolution() -> Result<()> {
    let (_store, q) = quartet().await?;
    q.up_to_conflict().await?;

    // one edit in a finished round, one still pending
    q.b.publish(insert(2, "b2")).await?;
    q.b.reconcile().await?;
    q.b.publish(insert(3, "b3")).await?;

    q.b.resolve(&BTreeMap::from([(3, BTreeMap::from([(0, Some(1))]))])).await?;
    assert_eq!(q.b.dump().await?, vec![r(1, "w"), r(2, "b2"), r(3, "b3")]);
    Ok(())
}

#[tokio::test]
async fn test_bad_resolutions_are_refused() -> Result<()> {
    let (_store, q) = quartet().await?;
    q.up_to_conflict().await?;

    let unknown_round = q.b.resolve(&BTreeMap::from([(9, BTreeMap::from([(0, None)]))])).await;
    assert!(matches!(unknown_round, Err(ReconcileError::Consistency(_))));
    let unknown_option = q.b.resolve(&BTreeMap::from([(3, BTreeMap::from([(0, Some(7))]))])).await;
    assert!(matches!(unknown_option, Err(ReconcileError::Consistency(_))));
    assert_eq!(q.b.current_round().await?, 3);
    Ok(())
}

#[tokio::test]
async fn test_publishing_is_checked_against_the_replica() -> Result<()> {
    let (_store, q) = quartet().await?;
    q.a.publish(insert(1, "x")).await?;

    assert!(matches!(q.a.publish(modify(1, "nope", "z")).await, Err(ReconcileError::Storage(_))));
    let unknown = vec![Change::Insert(tuple!("Q", 1; 1))];
    assert!(matches!(q.a.publish(unknown).await, Err(ReconcileError::Trust(_))));

    // several changes to one key collapse into one update
    let changes = vec![Change::Modify { old: r(1, "x"), new: r(1, "x2") }, Change::Modify { old: r(1, "x2"), new: r(1, "x3") }];
    let txn = q.a.publish(changes).await?;
    assert_eq!(txn.updates.len(), 1);
    assert_eq!(txn.updates[0].old(), Some(&r(1, "x")));
    assert_eq!(txn.updates[0].prev_tids(), &BTreeSet::from([tid(1, "A")]));
    assert_eq!(q.a.get(&key(1)).await?, Some(r(1, "x3")));
    Ok(())
}

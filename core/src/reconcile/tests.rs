use std::collections::{BTreeMap, BTreeSet};

use orchestra_proto::{tuple, Decision, Initial, TxnPeerId, Update};

use super::*;
use crate::{
    candidates::Candidates,
    chain::TxnChain,
    config::ReconcilerConfig,
    conflict::ConflictKind,
    error::{ConsistencyError, ReconcileError},
    storage::{memory::MemoryStateStore, DecisionTable, StateStore},
};

fn tid(n: u32, peer: &str) -> TxnPeerId { TxnPeerId::new(n, peer) }

struct Fixture {
    txns: BTreeMap<TxnPeerId, Vec<Update>>,
    oracle: DecisionTable,
}

impl Fixture {
    fn new() -> Self { Self { txns: BTreeMap::new(), oracle: DecisionTable::new("B".into()) } }

    fn publish(&mut self, id: TxnPeerId, updates: Vec<Update>) { self.txns.insert(id, updates); }

    fn accept(&mut self, id: TxnPeerId) { self.oracle.record(&Decision::accept(id, 1)); }

    async fn candidates(&self, buckets: &[(u32, &[TxnPeerId])]) -> Candidates {
        let mut candidates = Candidates::new();
        for (priority, heads) in buckets {
            for head in heads.iter() {
                candidates.push(*priority, TxnChain::build(head.clone(), &self.txns, &self.oracle).await.unwrap());
            }
        }
        candidates
    }
}

/// A state holding R(1,"x"), written by A:1 in round 1
async fn seeded_state() -> MemoryStateStore {
    let state = MemoryStateStore::new();
    state.apply(1, &[Update::insertion(tuple!("R", 1; 1, "x"), tid(1, "A"))]).await.unwrap();
    state.advance_round().await.unwrap();
    state
}

/// A:1 inserted x and is accepted; A:3 moves it to z, D:4 to w
fn divergent_modifications() -> Fixture {
    let mut fixture = Fixture::new();
    fixture.publish(tid(1, "A"), vec![Update::insertion(tuple!("R", 1; 1, "x"), tid(1, "A"))]);
    fixture.accept(tid(1, "A"));
    fixture.publish(
        tid(3, "A"),
        vec![Update::modification(tuple!("R", 1; 1, "x"), tuple!("R", 1; 1, "z"), tid(3, "A")).with_prev_tids([tid(1, "A")].into())],
    );
    fixture.publish(
        tid(4, "D"),
        vec![Update::modification(tuple!("R", 1; 1, "x"), tuple!("R", 1; 1, "w"), tid(4, "D")).with_prev_tids([tid(1, "A")].into())],
    );
    fixture
}

#[tokio::test]
async fn test_equal_priority_rivals_are_both_deferred() {
    let fixture = divergent_modifications();
    let state = seeded_state().await;
    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::default());

    let candidates = fixture.candidates(&[(5, &[tid(3, "A"), tid(4, "D")])]).await;
    let outcome = reconciler.run_round(&state, RoundInput { recno: 2, candidates, delta: vec![] }).await.unwrap();

    assert!(outcome.decisions.is_empty());
    assert_eq!(outcome.statuses[&tid(3, "A")], TxnStatus::DeferConflict);
    assert_eq!(outcome.statuses[&tid(4, "D")], TxnStatus::DeferConflict);
    assert_eq!(outcome.deferred, BTreeSet::from([tid(3, "A"), tid(4, "D")]));

    assert_eq!(outcome.conflicts.len(), 1);
    let conflict = outcome.conflicts.get(0).unwrap();
    assert_eq!(conflict.kind(), ConflictKind::Update);
    let values: Vec<_> = conflict.options.iter().map(|o| o.update.new_value().cloned()).collect();
    assert_eq!(values, vec![Some(tuple!("R", 1; 1, "z")), Some(tuple!("R", 1; 1, "w"))]);

    // nothing applied, and the key is now dirty
    assert_eq!(state.get_by_key(2, &tuple!("R", 1; 1).key()).await.unwrap(), Some(tuple!("R", 1; 1, "x")));
    assert!(reconciler.dirty().is_dirty(&tuple!("R", 1; 1).key(), 2));
    assert_eq!(reconciler.first_deferral(&BTreeSet::from([tid(4, "D")])), Some(2));
}

#[tokio::test]
async fn test_higher_priority_wins() {
    let fixture = divergent_modifications();
    let state = seeded_state().await;
    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::default());

    let candidates = fixture.candidates(&[(5, &[tid(3, "A")]), (2, &[tid(4, "D")])]).await;
    let outcome = reconciler.run_round(&state, RoundInput { recno: 2, candidates, delta: vec![] }).await.unwrap();

    assert_eq!(outcome.decisions, vec![Decision::accept(tid(3, "A"), 2), Decision::reject(tid(4, "D"), 2)]);
    assert_eq!(outcome.statuses[&tid(4, "D")], TxnStatus::RejectConflict);
    assert_eq!(state.get_by_key(2, &tuple!("R", 1; 1).key()).await.unwrap(), Some(tuple!("R", 1; 1, "z")));
    assert!(outcome.conflicts.is_empty());
}

#[tokio::test]
async fn test_dirty_keys_defer_later_rounds() {
    let mut fixture = divergent_modifications();
    let state = seeded_state().await;
    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::default());

    let candidates = fixture.candidates(&[(5, &[tid(3, "A"), tid(4, "D")])]).await;
    reconciler.run_round(&state, RoundInput { recno: 2, candidates, delta: vec![] }).await.unwrap();
    state.advance_round().await.unwrap();

    // a newcomer touching the contested key waits as well, even alone in its bucket
    fixture.publish(
        tid(5, "E"),
        vec![Update::modification(tuple!("R", 1; 1, "x"), tuple!("R", 1; 1, "e"), tid(5, "E")).with_prev_tids([tid(1, "A")].into())],
    );
    let candidates = fixture.candidates(&[(9, &[tid(5, "E")]), (5, &[tid(3, "A"), tid(4, "D")])]).await;
    let outcome = reconciler.run_round(&state, RoundInput { recno: 3, candidates, delta: vec![] }).await.unwrap();
    assert!(outcome.decisions.is_empty());
    assert!(outcome.statuses.values().all(|s| *s == TxnStatus::Defer));
    // deferred rivals keep showing up as conflicts
    assert_eq!(outcome.conflicts.get(0).map(|c| c.options.len()), Some(3));

    // rewinding drops the marks made in the rewound rounds
    reconciler.rewind_to(1);
    assert!(reconciler.dirty().is_empty());
    assert!(reconciler.outcome(2).is_none());
}

#[tokio::test]
async fn test_state_and_delta_screening() {
    let mut fixture = Fixture::new();
    // expects a value the state does not hold
    fixture.publish(tid(2, "A"), vec![Update::deletion(tuple!("R", 1; 1, "nope"), tid(2, "A"))]);
    // claims key 2, which the local delta just filled differently
    fixture.publish(tid(3, "A"), vec![Update::insertion(tuple!("R", 1; 2, "theirs"), tid(3, "A"))]);
    fixture.publish(tid(4, "A"), vec![Update::insertion(tuple!("R", 1; 3, "fine"), tid(4, "A"))]);

    let state = seeded_state().await;
    let local = Update::insertion(tuple!("R", 1; 2, "mine"), tid(1, "B"));
    state.apply(2, &[local.clone()]).await.unwrap();

    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::default());
    let candidates = fixture.candidates(&[(5, &[tid(2, "A"), tid(3, "A"), tid(4, "A")])]).await;
    let outcome = reconciler.run_round(&state, RoundInput { recno: 2, candidates, delta: vec![local] }).await.unwrap();

    assert_eq!(outcome.statuses[&tid(2, "A")], TxnStatus::Reject);
    assert_eq!(outcome.statuses[&tid(3, "A")], TxnStatus::Reject);
    assert_eq!(outcome.statuses[&tid(4, "A")], TxnStatus::Accept);
    assert_eq!(outcome.accepted(), BTreeSet::from([tid(4, "A")]));
    assert_eq!(outcome.rejected(), BTreeSet::from([tid(2, "A"), tid(3, "A")]));
    assert_eq!(outcome.applied.len(), 2);
}

#[tokio::test]
async fn test_overlapping_chains_apply_once() {
    let mut fixture = divergent_modifications();
    // A:5 builds on A:3
    fixture.publish(
        tid(5, "A"),
        vec![Update::modification(tuple!("R", 1; 1, "z"), tuple!("R", 1; 1, "q"), tid(5, "A")).with_prev_tids([tid(3, "A")].into())],
    );
    let state = seeded_state().await;
    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::default());

    let candidates = fixture.candidates(&[(5, &[tid(3, "A"), tid(5, "A")])]).await;
    let outcome = reconciler.run_round(&state, RoundInput { recno: 2, candidates, delta: vec![] }).await.unwrap();

    assert_eq!(outcome.accepted(), BTreeSet::from([tid(3, "A"), tid(5, "A")]));
    assert_eq!(state.get_by_key(2, &tuple!("R", 1; 1).key()).await.unwrap(), Some(tuple!("R", 1; 1, "q")));
    // the second chain was rebased onto what the first one left behind
    assert_eq!(outcome.applied[1].old(), Some(&tuple!("R", 1; 1, "z")));
}

#[tokio::test]
async fn test_dependent_carries_its_antecedent_past_a_tie() {
    let mut fixture = divergent_modifications();
    fixture.publish(
        tid(5, "A"),
        vec![Update::modification(tuple!("R", 1; 1, "z"), tuple!("R", 1; 1, "q"), tid(5, "A")).with_prev_tids([tid(3, "A")].into())],
    );
    let state = seeded_state().await;
    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::default());

    // A:5 outranks everything but carries A:3, which ties with D:4
    let candidates = fixture.candidates(&[(9, &[tid(5, "A")]), (5, &[tid(3, "A"), tid(4, "D")])]).await;
    let outcome = reconciler.run_round(&state, RoundInput { recno: 2, candidates, delta: vec![] }).await.unwrap();

    assert_eq!(outcome.statuses[&tid(5, "A")], TxnStatus::Accept);
    assert_eq!(outcome.statuses[&tid(4, "D")], TxnStatus::RejectConflict);
    assert_eq!(outcome.accepted(), BTreeSet::from([tid(3, "A"), tid(5, "A")]));
}

#[tokio::test]
async fn test_rounds_are_deterministic() {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let fixture = divergent_modifications();
        let state = seeded_state().await;
        let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::default());
        let candidates = fixture.candidates(&[(5, &[tid(3, "A"), tid(4, "D")])]).await;
        let outcome = reconciler.run_round(&state, RoundInput { recno: 2, candidates, delta: vec![] }).await.unwrap();
        runs.push((outcome, reconciler.dirty().clone(), state.dump(2).await.unwrap()));
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn test_initial_conflict_between_descendants() {
    // A:1 inserts x; A:2 deletes it again while D:1 moves it to w
    let mut fixture = Fixture::new();
    fixture.publish(tid(1, "A"), vec![Update::insertion(tuple!("R", 1; 1, "x"), tid(1, "A"))]);
    fixture.publish(tid(2, "A"), vec![Update::deletion(tuple!("R", 1; 1, "x"), tid(2, "A")).with_prev_tids([tid(1, "A")].into())]);
    fixture.publish(
        tid(1, "D"),
        vec![Update::modification(tuple!("R", 1; 1, "x"), tuple!("R", 1; 1, "w"), tid(1, "D")).with_prev_tids([tid(1, "A")].into())],
    );
    let state = MemoryStateStore::new();
    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::default());

    let candidates = fixture.candidates(&[(5, &[tid(1, "A"), tid(1, "D"), tid(2, "A")])]).await;
    let outcome = reconciler.run_round(&state, RoundInput { recno: 1, candidates, delta: vec![] }).await.unwrap();

    assert_eq!(outcome.statuses[&tid(1, "A")], TxnStatus::Accept);
    assert_eq!(outcome.statuses[&tid(1, "D")], TxnStatus::DeferConflict);
    assert_eq!(outcome.statuses[&tid(2, "A")], TxnStatus::DeferConflict);
    assert_eq!(outcome.decisions, vec![Decision::accept(tid(1, "A"), 1)]);
    assert_eq!(state.get_by_key(1, &tuple!("R", 1; 1).key()).await.unwrap(), Some(tuple!("R", 1; 1, "x")));

    assert_eq!(outcome.conflicts.len(), 1);
    let conflict = outcome.conflicts.get(0).unwrap();
    assert_eq!(conflict.kind(), ConflictKind::Initial);
    let values: Vec<_> = conflict.options.iter().map(|o| o.update.new_value().cloned()).collect();
    assert_eq!(values, vec![Some(tuple!("R", 1; 1, "w")), None]);
}

#[tokio::test]
async fn test_key_conflict_merges_equal_proposals() {
    let mut fixture = Fixture::new();
    fixture.publish(tid(1, "A"), vec![Update::insertion(tuple!("R", 1; 1, "a"), tid(1, "A"))]);
    fixture.publish(tid(1, "D"), vec![Update::insertion(tuple!("R", 1; 1, "d"), tid(1, "D"))]);
    fixture.publish(tid(1, "E"), vec![Update::insertion(tuple!("R", 1; 1, "a"), tid(1, "E"))]);
    let state = MemoryStateStore::new();
    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::default());

    let candidates = fixture.candidates(&[(5, &[tid(1, "A"), tid(1, "D"), tid(1, "E")])]).await;
    let outcome = reconciler.run_round(&state, RoundInput { recno: 1, candidates, delta: vec![] }).await.unwrap();

    assert!(outcome.decisions.is_empty());
    assert!(outcome.statuses.values().all(|s| *s == TxnStatus::DeferConflict));
    assert!(reconciler.dirty().is_dirty(&tuple!("R", 1; 1).key(), 1));

    assert_eq!(outcome.conflicts.len(), 1);
    let conflict = outcome.conflicts.get(0).unwrap();
    assert_eq!(conflict.kind(), ConflictKind::Key);
    assert_eq!(conflict.options.len(), 2);
    assert_eq!(conflict.options[0].txns, BTreeSet::from([tid(1, "A"), tid(1, "E")]));
    assert_eq!(conflict.options[1].txns, BTreeSet::from([tid(1, "D")]));
}

#[tokio::test]
async fn test_incomparable_deferred_chains_are_faulted() {
    let mut fixture = divergent_modifications();
    let state = seeded_state().await;
    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::default());
    let candidates = fixture.candidates(&[(5, &[tid(3, "A"), tid(4, "D")])]).await;
    reconciler.run_round(&state, RoundInput { recno: 2, candidates, delta: vec![] }).await.unwrap();
    state.advance_round().await.unwrap();

    // both wait on the dirty key, and one deletes the key the other inserts
    fixture.publish(tid(5, "E"), vec![Update::deletion(tuple!("R", 1; 1, "x"), tid(5, "E")).with_prev_tids([tid(1, "A")].into())]);
    fixture.publish(tid(6, "F"), vec![Update::insertion(tuple!("R", 1; 1, "y"), tid(6, "F"))]);
    let candidates = fixture.candidates(&[(5, &[tid(5, "E"), tid(6, "F")])]).await;
    let outcome = reconciler.run_round(&state, RoundInput { recno: 3, candidates, delta: vec![] }).await.unwrap();

    assert!(outcome.decisions.is_empty());
    assert_eq!(outcome.faulted.keys().cloned().collect::<BTreeSet<_>>(), BTreeSet::from([tid(5, "E"), tid(6, "F")]));
    assert!(outcome.statuses.is_empty());
    assert!(outcome.deferred.is_empty());
    assert!(outcome.conflicts.is_empty());
}

/// A:7 and D:8 both claim descent from one seed fact but live in different relations, so nothing orders them
fn unordered_descendants() -> Fixture {
    let seed = Initial::new(tuple!("R", 1; 1, "seed"), tid(1, "S"));
    let mut fixture = Fixture::new();
    fixture.publish(tid(7, "A"), vec![Update::insertion(tuple!("R", 1; 1, "p"), tid(7, "A")).with_initial(seed.clone())]);
    fixture.publish(tid(8, "D"), vec![Update::insertion(tuple!("T", 1; 2, "q"), tid(8, "D")).with_initial(seed)]);
    fixture
}

#[tokio::test]
async fn test_undetermined_precedence_is_fatal_by_default() {
    let fixture = unordered_descendants();
    let state = MemoryStateStore::new();
    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::strict());

    let candidates = fixture.candidates(&[(9, &[tid(7, "A")]), (5, &[tid(8, "D")])]).await;
    let result = reconciler.run_round(&state, RoundInput { recno: 1, candidates, delta: vec![] }).await;
    assert!(matches!(result, Err(ReconcileError::Consistency(ConsistencyError::UndeterminedPrecedence { .. }))));
    assert!(reconciler.outcome(1).is_none());
}

#[tokio::test]
async fn test_undetermined_precedence_defers_when_lenient() {
    let fixture = unordered_descendants();
    let state = MemoryStateStore::new();
    let mut reconciler = Reconciler::new("B".into(), ReconcilerConfig::lenient());

    let candidates = fixture.candidates(&[(9, &[tid(7, "A")]), (5, &[tid(8, "D")])]).await;
    let outcome = reconciler.run_round(&state, RoundInput { recno: 1, candidates, delta: vec![] }).await.unwrap();

    assert_eq!(outcome.decisions, vec![Decision::accept(tid(7, "A"), 1)]);
    assert_eq!(outcome.statuses[&tid(8, "D")], TxnStatus::DeferConflict);
    assert!(reconciler.dirty().is_dirty(&tuple!("T", 1; 2).key(), 1));
    assert_eq!(state.get_by_key(1, &tuple!("T", 1; 2).key()).await.unwrap(), None);
}

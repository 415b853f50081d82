use std::sync::Arc;

use orchestra_proto::{Key, PeerId, Recno, RelationId, Transaction, Tuple, TxnPeerId, Update};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    config::ReconcilerConfig,
    error::{ConsistencyError, ReconcileError, TrustError},
    flatten::flatten,
    reconcile::{ConflictSet, Reconciler, RoundOutcome},
    replay::{self, LocalDelta, Resolutions},
    storage::{RoundRecord, StateStore, UpdateLog},
    trust::{TrustConditions, TrustedPeer, TuplePredicate},
};

/// A local edit, before it is stamped with a transaction id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Insert(Tuple),
    Delete(Tuple),
    Modify { old: Tuple, new: Tuple },
}

impl Change {
    fn relation(&self) -> &RelationId {
        match self {
            Change::Insert(t) | Change::Delete(t) | Change::Modify { old: t, .. } => t.relation(),
        }
    }

    fn into_update(self, tid: TxnPeerId) -> Update {
        match self {
            Change::Insert(new) => Update::insertion(new, tid),
            Change::Delete(old) => Update::deletion(old, tid),
            Change::Modify { old, new } => Update::modification(old, new, tid),
        }
    }
}

struct PeerInner {
    trust: TrustConditions,
    reconciler: Reconciler,
}

/// A participant holding its own replica. Every operation holds the peer's lock for its whole duration, so rounds,
/// publications and replays never interleave.
pub struct Peer {
    pub id: PeerId,
    log: Arc<dyn UpdateLog>,
    state: Arc<dyn StateStore>,
    inner: Mutex<PeerInner>,
}

impl Peer {
    pub fn new(
        log: Arc<dyn UpdateLog>,
        state: Arc<dyn StateStore>,
        relations: impl IntoIterator<Item = RelationId>,
        config: ReconcilerConfig,
    ) -> Self {
        let id = log.peer().clone();
        let trust = TrustConditions::with_max_priority(id.clone(), relations, config.max_priority);
        let reconciler = Reconciler::new(id.clone(), config);
        Self { id, log, state, inner: Mutex::new(PeerInner { trust, reconciler }) }
    }

    pub async fn trust(&self) -> TrustConditions { self.inner.lock().await.trust.clone() }

    pub async fn add_trust_condition(
        &self,
        peer: impl Into<TrustedPeer>,
        relation: impl Into<RelationId>,
        priority: u32,
        predicate: Option<TuplePredicate>,
    ) -> Result<(), ReconcileError> {
        let mut inner = self.inner.lock().await;
        inner.trust.add_trusted(peer, relation, priority, predicate)?;
        Ok(())
    }

    /// Last completed round
    pub async fn current_round(&self) -> Result<Recno, ReconcileError> {
        let _guard = self.inner.lock().await;
        self.check_rounds().await
    }

    /// The value under `key`, local edits of the open round included
    pub async fn get(&self, key: &Key) -> Result<Option<Tuple>, ReconcileError> {
        let _guard = self.inner.lock().await;
        let round = self.check_rounds().await? + 1;
        Ok(self.state.get_by_key(round, key).await?)
    }

    /// Every tuple in the replica, local edits of the open round included
    pub async fn dump(&self) -> Result<Vec<Tuple>, ReconcileError> {
        let _guard = self.inner.lock().await;
        let round = self.check_rounds().await? + 1;
        Ok(self.state.dump(round).await?)
    }

    /// Conflicts left open by round `recno`
    pub async fn conflicts(&self, recno: Recno) -> Option<ConflictSet> { self.inner.lock().await.reconciler.conflicts(recno).cloned() }

    pub async fn outcome(&self, recno: Recno) -> Option<RoundOutcome> { self.inner.lock().await.reconciler.outcome(recno).cloned() }

    /// Apply `changes` locally as one transaction and publish it
    pub async fn publish(&self, changes: Vec<Change>) -> Result<Transaction, ReconcileError> {
        let inner = self.inner.lock().await;
        let round = self.check_rounds().await? + 1;

        if let Some(change) = changes.iter().find(|c| !inner.trust.relations().any(|r| r == c.relation())) {
            return Err(TrustError::UnknownRelation(change.relation().clone()).into());
        }

        let id = self.log.next_transaction_id().await?;
        let mut updates = Vec::with_capacity(changes.len());
        for change in changes {
            let update = change.into_update(id.clone());
            let prev_tids = self.state.writers(round, &update.subject_key()).await?;
            updates.push(update.with_prev_tids(prev_tids));
        }
        let updates = flatten(&updates)?;

        // the state checks every old value, so nothing inconsistent reaches the log
        self.state.apply(round, &updates).await?;
        let txn = Transaction::new(id, updates);
        let seq = self.log.publish(round, &txn).await?;
        info!("{} published {} ({} updates, #{})", self.id, txn.id, txn.updates.len(), seq);
        Ok(txn)
    }

    /// Run one reconciliation round over everything published so far
    pub async fn reconcile(&self) -> Result<RoundOutcome, ReconcileError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let record = RoundRecord::new(self.check_rounds().await? + 1, self.log.horizon().await?, inner.trust.clone());

        let outcome = replay::rerun_round(&*self.log, &*self.state, &mut inner.reconciler, &record, LocalDelta::Applied).await?;
        replay::commit_round(&*self.log, &*self.state, record, &outcome).await?;
        Ok(outcome)
    }

    /// Settle conflicts from past rounds and recompute every round from the earliest one affected. Recomputed rounds
    /// keep the trust conditions they first ran under.
    ///
    /// Every transaction proposing an option other than the chosen one is rejected; with no choice, every option
    /// is. Returns the outcomes of the recomputed rounds.
    pub async fn resolve(&self, resolutions: &Resolutions) -> Result<Vec<RoundOutcome>, ReconcileError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let last = self.check_rounds().await?;

        let forced = replay::forced_rejections(&inner.reconciler, resolutions)?;
        let Some(earliest) = forced.keys().next().copied() else {
            debug!("{} resolution rejects nothing", self.id);
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for recno in earliest..=last {
            let mut record = self.log.round_record(recno).await?.ok_or(ConsistencyError::UnknownRound(recno))?;
            record.forced.extend(forced.get(&recno).into_iter().flatten().cloned());
            records.push(record);
        }
        let pending: Vec<Update> = self.log.local_transactions_at(last + 1).await?.into_iter().flat_map(|txn| txn.updates).collect();

        info!("{} resolving: rejecting {:?}, rerunning rounds {}..={}", self.id, forced.values().flatten().collect::<Vec<_>>(), earliest, last);
        self.log.rewind_to(earliest - 1).await?;
        self.state.rewind_to(earliest - 1).await?;
        inner.reconciler.rewind_to(earliest - 1);

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let outcome = replay::rerun_round(&*self.log, &*self.state, &mut inner.reconciler, &record, LocalDelta::Reapply).await?;
            replay::commit_round(&*self.log, &*self.state, record, &outcome).await?;
            outcomes.push(outcome);
        }
        if !pending.is_empty() {
            self.state.apply(last + 1, &pending).await?;
        }
        Ok(outcomes)
    }

    /// Recompute every recorded round after a restart and check that the recorded decisions come out again.
    ///
    /// Decisions of a round that never finished are discarded first. On success the conflict and dirty-key
    /// bookkeeping is rebuilt from the replay.
    pub async fn replay_on_reconnect(&self) -> Result<Vec<RoundOutcome>, ReconcileError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let last = self.log.current_round().await?;
        self.log.rewind_to(last).await?;
        self.check_rounds().await?;

        let (reconciler, outcomes) = replay::replay_log(&*self.log, inner.reconciler.config().clone()).await?;
        inner.reconciler = reconciler;
        info!("{} reconnected at round {}", self.id, last);
        Ok(outcomes)
    }

    async fn check_rounds(&self) -> Result<Recno, ReconcileError> {
        let log = self.log.current_round().await?;
        let state = self.state.current_round().await?;
        if log != state {
            return Err(ConsistencyError::RoundMismatch { log, state }.into());
        }
        Ok(log)
    }
}

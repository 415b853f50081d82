//! Interfaces to the update log and the snapshot store.
//!
//! The reconciliation engine only ever talks to these traits. [`memory`] provides an in-process backend; the
//! `orchestra-storage-sled` crate provides a durable one.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use orchestra_proto::{Decision, Key, PeerId, Recno, Transaction, Tuple, TxnPeerId, Update};
use serde::{Deserialize, Serialize};

use crate::{error::StorageError, trust::TrustConditions};

/// Supplies the contents of published transactions
#[async_trait]
pub trait TxnSource: Send + Sync {
    async fn get_txn(&self, id: &TxnPeerId) -> Result<Option<Vec<Update>>, StorageError>;
}

#[async_trait]
impl TxnSource for BTreeMap<TxnPeerId, Vec<Update>> {
    async fn get_txn(&self, id: &TxnPeerId) -> Result<Option<Vec<Update>>, StorageError> { Ok(self.get(id).cloned()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionState {
    Accepted,
    Rejected,
    Undecided,
}

pub trait DecisionOracle: Send + Sync {
    fn has_accepted(&self, id: &TxnPeerId) -> bool;

    fn has_rejected(&self, id: &TxnPeerId) -> bool;

    fn decision(&self, id: &TxnPeerId) -> DecisionState {
        if self.has_accepted(id) {
            DecisionState::Accepted
        } else if self.has_rejected(id) {
            DecisionState::Rejected
        } else {
            DecisionState::Undecided
        }
    }
}

/// Decisions known to one peer. The peer's own transactions are accepted by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionTable {
    owner: PeerId,
    decisions: BTreeMap<TxnPeerId, bool>,
}

impl DecisionTable {
    pub fn new(owner: PeerId) -> Self { Self { owner, decisions: BTreeMap::new() } }

    pub fn from_decisions<'a>(owner: PeerId, decisions: impl IntoIterator<Item = &'a Decision>) -> Self {
        let mut table = Self::new(owner);
        for decision in decisions {
            table.record(decision);
        }
        table
    }

    pub fn record(&mut self, decision: &Decision) { self.decisions.insert(decision.tid.clone(), decision.accepted); }

    pub fn force_reject(&mut self, id: TxnPeerId) { self.decisions.insert(id, false); }

    pub fn len(&self) -> usize { self.decisions.len() }

    pub fn is_empty(&self) -> bool { self.decisions.is_empty() }
}

impl DecisionOracle for DecisionTable {
    fn has_accepted(&self, id: &TxnPeerId) -> bool { id.peer == self.owner || self.decisions.get(id) == Some(&true) }

    fn has_rejected(&self, id: &TxnPeerId) -> bool { id.peer != self.owner && self.decisions.get(id) == Some(&false) }
}

/// What a completed round saw, so that replays see exactly the same inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub recno: Recno,
    /// Sequence high-water mark of the shared store when the round ran
    pub horizon: u64,
    /// Transactions rejected by conflict resolution before the round was rerun
    pub forced: BTreeSet<TxnPeerId>,
    /// Trust conditions in force when the round first ran. Reruns judge candidates by these, not by the peer's
    /// current conditions.
    pub trust: TrustConditions,
}

impl RoundRecord {
    pub fn new(recno: Recno, horizon: u64, trust: TrustConditions) -> Self { Self { recno, horizon, forced: BTreeSet::new(), trust } }
}

/// One peer's view of the shared update log: its publications, its decisions and its completed rounds.
#[async_trait]
pub trait UpdateLog: Send + Sync {
    fn peer(&self) -> &PeerId;

    /// Last completed round
    async fn current_round(&self) -> Result<Recno, StorageError>;

    /// Sequence number of the latest publication visible in the shared store
    async fn horizon(&self) -> Result<u64, StorageError>;

    async fn next_transaction_id(&self) -> Result<TxnPeerId, StorageError>;

    /// Publish a local transaction during round `recno`, returning its sequence number
    async fn publish(&self, recno: Recno, txn: &Transaction) -> Result<u64, StorageError>;

    async fn lookup(&self, id: &TxnPeerId) -> Result<Option<(u64, Transaction)>, StorageError>;

    /// Ids of all transactions with sequence numbers up to `horizon`, in publication order
    async fn published_through(&self, horizon: u64) -> Result<Vec<TxnPeerId>, StorageError>;

    /// This peer's own transactions published during round `recno`, in publication order
    async fn local_transactions_at(&self, recno: Recno) -> Result<Vec<Transaction>, StorageError>;

    async fn record_decisions(&self, recno: Recno, decisions: &[Decision]) -> Result<(), StorageError>;

    /// Close a round. Rounds must be finished in order.
    async fn finish_round(&self, record: RoundRecord) -> Result<(), StorageError>;

    async fn round_record(&self, recno: Recno) -> Result<Option<RoundRecord>, StorageError>;

    async fn decisions_at(&self, recno: Recno) -> Result<Vec<Decision>, StorageError>;

    /// All decisions recorded in rounds `1..=recno`
    async fn decisions_through(&self, recno: Recno) -> Result<Vec<Decision>, StorageError>;

    /// Forget decisions and round records after `recno`. Local publications are kept.
    async fn rewind_to(&self, recno: Recno) -> Result<(), StorageError>;

    /// Contents of every transaction accepted in round `recno`
    async fn accepted_at(&self, recno: Recno) -> Result<BTreeMap<TxnPeerId, Vec<Update>>, StorageError> {
        let mut accepted = BTreeMap::new();
        for decision in self.decisions_at(recno).await?.into_iter().filter(|d| d.accepted) {
            let (_, txn) = self.lookup(&decision.tid).await?.ok_or_else(|| StorageError::TransactionNotFound(decision.tid.clone()))?;
            accepted.insert(decision.tid, txn.updates);
        }
        Ok(accepted)
    }
}

/// A log restricted to the publications a round was allowed to see
pub struct HorizonSource<'a, L: UpdateLog + ?Sized> {
    log: &'a L,
    horizon: u64,
}

impl<'a, L: UpdateLog + ?Sized> HorizonSource<'a, L> {
    pub fn new(log: &'a L, horizon: u64) -> Self { Self { log, horizon } }
}

#[async_trait]
impl<'a, L: UpdateLog + ?Sized> TxnSource for HorizonSource<'a, L> {
    async fn get_txn(&self, id: &TxnPeerId) -> Result<Option<Vec<Update>>, StorageError> {
        Ok(self.log.lookup(id).await?.filter(|(seq, _)| *seq <= self.horizon).map(|(_, txn)| txn.updates))
    }
}

/// A key's value as of some round, together with the transactions that last wrote it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub value: Option<Tuple>,
    pub writers: BTreeSet<TxnPeerId>,
}

/// Versioned snapshot of relation contents, one version per key per round.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Last completed round. Writes go to `current_round() + 1`.
    async fn current_round(&self) -> Result<Recno, StorageError>;

    /// Value under `key` as of `round`
    async fn get_by_key(&self, round: Recno, key: &Key) -> Result<Option<Tuple>, StorageError>;

    /// Transactions that wrote the value under `key` as of `round`
    async fn writers(&self, round: Recno, key: &Key) -> Result<BTreeSet<TxnPeerId>, StorageError>;

    /// Apply updates in order, all or nothing. Every old value must match the stored value, and an insertion may
    /// only land on an empty key or one already holding the same value.
    async fn apply(&self, round: Recno, updates: &[Update]) -> Result<(), StorageError>;

    async fn advance_round(&self) -> Result<Recno, StorageError>;

    /// Discard every version written after `round`
    async fn rewind_to(&self, round: Recno) -> Result<(), StorageError>;

    /// All tuples present as of `round`, in key order
    async fn dump(&self, round: Recno) -> Result<Vec<Tuple>, StorageError>;
}

/// Validate `updates` against the state returned by `read`, and compute the version each touched key ends up with.
pub fn stage_updates<F>(updates: &[Update], mut read: F) -> Result<BTreeMap<Key, Version>, StorageError>
where F: FnMut(&Key) -> Result<Option<Tuple>, StorageError> {
    let mut staged: BTreeMap<Key, Version> = BTreeMap::new();
    let mut lookup = |staged: &BTreeMap<Key, Version>, key: &Key| match staged.get(key) {
        Some(version) => Ok(version.value.clone()),
        None => read(key),
    };

    for update in updates {
        let old_key = update.old_key();
        let new_key = update.new_key();
        if let (Some(old), Some(key)) = (update.old(), &old_key) {
            let found = lookup(&staged, key)?;
            if found.as_ref() != Some(old) {
                return Err(StorageError::StateMismatch { key: key.clone(), expected: Some(old.clone()), found });
            }
            if new_key.as_ref() != Some(key) {
                staged.insert(key.clone(), Version { value: None, writers: update.tids().clone() });
            }
        }
        if let (Some(new), Some(key)) = (update.new_value(), &new_key) {
            if old_key.as_ref() != Some(key) {
                let found = lookup(&staged, key)?;
                if found.as_ref().is_some_and(|existing| existing != new) {
                    return Err(StorageError::StateMismatch { key: key.clone(), expected: None, found });
                }
            }
            staged.insert(key.clone(), Version { value: Some(new.clone()), writers: update.tids().clone() });
        }
    }
    Ok(staged)
}

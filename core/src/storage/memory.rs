use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use orchestra_proto::{Decision, Key, PeerId, Recno, Transaction, Tuple, TxnPeerId};
use tracing::debug;

use super::{stage_updates, RoundRecord, StateStore, UpdateLog, Version};
use crate::error::StorageError;

/// Shared, in-process update store. Every peer's [`MemoryLog`] is a view onto the same publications.
#[derive(Clone, Default)]
pub struct MemoryUpdateStore {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    /// Sequence number `n` is at index `n - 1`
    published: Vec<Transaction>,
    index: BTreeMap<TxnPeerId, u64>,
    peers: BTreeMap<PeerId, PeerRecords>,
}

#[derive(Default)]
struct PeerRecords {
    next_tid: u32,
    local: BTreeMap<Recno, Vec<TxnPeerId>>,
    decisions: BTreeMap<Recno, Vec<Decision>>,
    rounds: BTreeMap<Recno, RoundRecord>,
}

impl MemoryUpdateStore {
    pub fn new() -> Self { Self::default() }

    pub fn log(&self, peer: impl Into<PeerId>) -> MemoryLog { MemoryLog { peer: peer.into(), store: self.clone() } }

    /// Number of transactions published so far
    pub fn len(&self) -> Result<usize, StorageError> { Ok(self.inner.read()?.published.len()) }

    pub fn is_empty(&self) -> Result<bool, StorageError> { Ok(self.len()? == 0) }
}

pub struct MemoryLog {
    peer: PeerId,
    store: MemoryUpdateStore,
}

impl MemoryLog {
    fn with_records<T>(&self, f: impl FnOnce(&PeerRecords) -> T) -> Result<T, StorageError> {
        let inner = self.store.inner.read()?;
        Ok(match inner.peers.get(&self.peer) {
            Some(records) => f(records),
            None => f(&PeerRecords::default()),
        })
    }

    fn with_records_mut<T>(&self, f: impl FnOnce(&mut PeerRecords) -> Result<T, StorageError>) -> Result<T, StorageError> {
        let mut inner = self.store.inner.write()?;
        f(inner.peers.entry(self.peer.clone()).or_default())
    }
}

#[async_trait]
impl UpdateLog for MemoryLog {
    fn peer(&self) -> &PeerId { &self.peer }

    async fn current_round(&self) -> Result<Recno, StorageError> {
        self.with_records(|records| records.rounds.keys().next_back().copied().unwrap_or(0))
    }

    async fn horizon(&self) -> Result<u64, StorageError> { Ok(self.store.inner.read()?.published.len() as u64) }

    async fn next_transaction_id(&self) -> Result<TxnPeerId, StorageError> {
        self.with_records_mut(|records| {
            records.next_tid += 1;
            Ok(TxnPeerId::new(records.next_tid, self.peer.clone()))
        })
    }

    async fn publish(&self, recno: Recno, txn: &Transaction) -> Result<u64, StorageError> {
        let mut inner = self.store.inner.write()?;
        if inner.index.contains_key(&txn.id) {
            return Err(StorageError::DuplicateTransaction(txn.id.clone()));
        }
        inner.published.push(txn.clone());
        let seq = inner.published.len() as u64;
        inner.index.insert(txn.id.clone(), seq);
        inner.peers.entry(self.peer.clone()).or_default().local.entry(recno).or_default().push(txn.id.clone());
        debug!("{} published {} as #{}", self.peer, txn.id, seq);
        Ok(seq)
    }

    async fn lookup(&self, id: &TxnPeerId) -> Result<Option<(u64, Transaction)>, StorageError> {
        let inner = self.store.inner.read()?;
        Ok(inner.index.get(id).and_then(|seq| inner.published.get(*seq as usize - 1).map(|txn| (*seq, txn.clone()))))
    }

    async fn published_through(&self, horizon: u64) -> Result<Vec<TxnPeerId>, StorageError> {
        let inner = self.store.inner.read()?;
        Ok(inner.published.iter().take(horizon as usize).map(|txn| txn.id.clone()).collect())
    }

    async fn local_transactions_at(&self, recno: Recno) -> Result<Vec<Transaction>, StorageError> {
        let inner = self.store.inner.read()?;
        let Some(ids) = inner.peers.get(&self.peer).and_then(|records| records.local.get(&recno)) else { return Ok(Vec::new()) };
        ids.iter()
            .map(|id| {
                inner
                    .index
                    .get(id)
                    .and_then(|seq| inner.published.get(*seq as usize - 1).cloned())
                    .ok_or_else(|| StorageError::TransactionNotFound(id.clone()))
            })
            .collect()
    }

    async fn record_decisions(&self, recno: Recno, decisions: &[Decision]) -> Result<(), StorageError> {
        self.with_records_mut(|records| {
            records.decisions.entry(recno).or_default().extend(decisions.iter().cloned());
            Ok(())
        })
    }

    async fn finish_round(&self, record: RoundRecord) -> Result<(), StorageError> {
        self.with_records_mut(|records| {
            let expected = records.rounds.keys().next_back().copied().unwrap_or(0) + 1;
            if record.recno != expected {
                return Err(StorageError::OutOfOrderRound { expected, found: record.recno });
            }
            records.rounds.insert(record.recno, record);
            Ok(())
        })
    }

    async fn round_record(&self, recno: Recno) -> Result<Option<RoundRecord>, StorageError> {
        self.with_records(|records| records.rounds.get(&recno).cloned())
    }

    async fn decisions_at(&self, recno: Recno) -> Result<Vec<Decision>, StorageError> {
        self.with_records(|records| records.decisions.get(&recno).cloned().unwrap_or_default())
    }

    async fn decisions_through(&self, recno: Recno) -> Result<Vec<Decision>, StorageError> {
        self.with_records(|records| records.decisions.range(..=recno).flat_map(|(_, ds)| ds.iter().cloned()).collect())
    }

    async fn rewind_to(&self, recno: Recno) -> Result<(), StorageError> {
        self.with_records_mut(|records| {
            records.decisions.retain(|r, _| *r <= recno);
            records.rounds.retain(|r, _| *r <= recno);
            Ok(())
        })
    }
}

/// In-process versioned snapshot store
#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<StateInner>,
}

#[derive(Default)]
struct StateInner {
    round: Recno,
    versions: BTreeMap<Key, BTreeMap<Recno, Version>>,
}

impl StateInner {
    fn version(&self, round: Recno, key: &Key) -> Option<&Version> {
        self.versions.get(key).and_then(|history| history.range(..=round).next_back()).map(|(_, version)| version)
    }
}

impl MemoryStateStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn current_round(&self) -> Result<Recno, StorageError> { Ok(self.inner.read()?.round) }

    async fn get_by_key(&self, round: Recno, key: &Key) -> Result<Option<Tuple>, StorageError> {
        Ok(self.inner.read()?.version(round, key).and_then(|v| v.value.clone()))
    }

    async fn writers(&self, round: Recno, key: &Key) -> Result<BTreeSet<TxnPeerId>, StorageError> {
        Ok(self.inner.read()?.version(round, key).map(|v| v.writers.clone()).unwrap_or_default())
    }

    async fn apply(&self, round: Recno, updates: &[orchestra_proto::Update]) -> Result<(), StorageError> {
        let mut inner = self.inner.write()?;
        if round != inner.round + 1 {
            return Err(StorageError::RoundUnavailable { requested: round, current: inner.round });
        }
        let staged = stage_updates(updates, |key| Ok(inner.version(round, key).and_then(|v| v.value.clone())))?;
        for (key, version) in staged {
            inner.versions.entry(key).or_default().insert(round, version);
        }
        Ok(())
    }

    async fn advance_round(&self) -> Result<Recno, StorageError> {
        let mut inner = self.inner.write()?;
        inner.round += 1;
        Ok(inner.round)
    }

    async fn rewind_to(&self, round: Recno) -> Result<(), StorageError> {
        let mut inner = self.inner.write()?;
        for history in inner.versions.values_mut() {
            history.retain(|r, _| *r <= round);
        }
        inner.versions.retain(|_, history| !history.is_empty());
        inner.round = inner.round.min(round);
        Ok(())
    }

    async fn dump(&self, round: Recno) -> Result<Vec<Tuple>, StorageError> {
        let inner = self.inner.read()?;
        Ok(inner.versions.keys().filter_map(|key| inner.version(round, key).and_then(|v| v.value.clone())).collect())
    }
}

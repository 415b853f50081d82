use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use orchestra_core::{
    error::StorageError,
    storage::{RoundRecord, UpdateLog},
};
use orchestra_proto::{Decision, PeerId, Recno, Transaction, TxnPeerId};
use sled::{transaction::TransactionError, Config, Db, Transactional, Tree};
use tokio::task;
use tracing::debug;

use crate::{
    error::{sled_error, SledStorageError},
    state::SledStateStore,
};

const NEXT_TID: &[u8] = b"next_tid";

pub(crate) fn recno_key(recno: Recno) -> [u8; 4] { recno.to_be_bytes() }

pub(crate) fn decode_recno(tree: &'static str, bytes: &[u8]) -> Result<Recno, StorageError> {
    let array: [u8; 4] = bytes.try_into().map_err(|_| SledStorageError::MalformedKey { tree, len: bytes.len() })?;
    Ok(Recno::from_be_bytes(array))
}

fn decode_seq(bytes: &[u8]) -> Result<u64, StorageError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| SledStorageError::MalformedKey { tree: "published", len: bytes.len() })?;
    Ok(u64::from_be_bytes(array))
}

/// The shared update store: every publication of every peer, in publication order.
#[derive(Clone)]
pub struct SledUpdateStore {
    pub db: Db,
    published: Tree,
    index: Tree,
    /// Sequence numbers must become visible in order
    publish_lock: Arc<Mutex<()>>,
}

impl SledUpdateStore {
    pub fn with_homedir_folder(folder_name: &str) -> anyhow::Result<Self> {
        let dir = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Failed to get home directory"))?.join(folder_name);
        Self::with_path(dir)
    }

    pub fn with_path(path: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&path)?;
        let db = sled::open(path.join("sled"))?;
        Self::open(db)
    }

    pub fn new() -> anyhow::Result<Self> { Self::with_homedir_folder(".orchestra") }

    pub fn new_test() -> anyhow::Result<Self> {
        let db = Config::new().temporary(true).flush_every_ms(None).open()?;
        Self::open(db)
    }

    fn open(db: Db) -> anyhow::Result<Self> {
        let published = db.open_tree("published")?;
        let index = db.open_tree("published_index")?;
        Ok(Self { db, published, index, publish_lock: Arc::new(Mutex::new(())) })
    }

    /// The view of one peer onto the store
    pub fn log(&self, peer: impl Into<PeerId>) -> anyhow::Result<SledLog> {
        let peer = peer.into();
        let tree = |suffix: &str| self.db.open_tree(format!("peer_{}_{}", peer, suffix));
        Ok(SledLog {
            meta: tree("meta")?,
            local: tree("local")?,
            decisions: tree("decisions")?,
            rounds: tree("rounds")?,
            store: self.clone(),
            peer,
        })
    }

    /// The snapshot store of one peer, kept in the same database
    pub fn state(&self, peer: impl Into<PeerId>) -> anyhow::Result<SledStateStore> { SledStateStore::open(&self.db, &peer.into()) }

    fn lookup_blocking(&self, id: &TxnPeerId) -> Result<Option<(u64, Transaction)>, StorageError> {
        let Some(seq) = self.index.get(id.to_bytes()).map_err(sled_error)? else { return Ok(None) };
        let seq = decode_seq(&seq)?;
        match self.published.get(seq.to_be_bytes()).map_err(sled_error)? {
            Some(bytes) => Ok(Some((seq, bincode::deserialize(&bytes)?))),
            None => Err(StorageError::TransactionNotFound(id.clone())),
        }
    }

    fn horizon_blocking(&self) -> Result<u64, StorageError> {
        match self.published.last().map_err(sled_error)? {
            Some((key, _)) => decode_seq(&key),
            None => Ok(0),
        }
    }
}

#[derive(Clone)]
pub struct SledLog {
    peer: PeerId,
    store: SledUpdateStore,
    meta: Tree,
    /// recno ++ seq -> ()
    local: Tree,
    /// recno -> decisions of that round
    decisions: Tree,
    /// recno -> round record
    rounds: Tree,
}

impl SledLog {
    fn current_round_blocking(&self) -> Result<Recno, StorageError> {
        match self.rounds.last().map_err(sled_error)? {
            Some((key, _)) => decode_recno("rounds", &key),
            None => Ok(0),
        }
    }

    fn next_transaction_id_blocking(&self) -> Result<TxnPeerId, StorageError> {
        let next = self
            .meta
            .update_and_fetch(NEXT_TID, |old| {
                let current = old.and_then(|bytes| <[u8; 4]>::try_from(bytes).ok()).map(u32::from_be_bytes).unwrap_or(0);
                Some((current + 1).to_be_bytes().to_vec())
            })
            .map_err(sled_error)?
            .ok_or_else(|| SledStorageError::Aborted("transaction id counter vanished".into()))?;
        Ok(TxnPeerId::new(decode_recno("meta", &next)?, self.peer.clone()))
    }

    fn publish_blocking(&self, recno: Recno, txn: &Transaction) -> Result<u64, StorageError> {
        let _guard = self.store.publish_lock.lock()?;
        let id = txn.id.to_bytes();
        if self.store.index.contains_key(&id).map_err(sled_error)? {
            return Err(StorageError::DuplicateTransaction(txn.id.clone()));
        }
        let seq = self.store.horizon_blocking()? + 1;
        let seq_key = seq.to_be_bytes();
        let bytes = bincode::serialize(txn)?;
        let mut local_key = recno_key(recno).to_vec();
        local_key.extend_from_slice(&seq_key);

        let result: Result<(), TransactionError<()>> =
            (&self.store.published, &self.store.index, &self.local).transaction(|(published, index, local)| {
                published.insert(seq_key.as_slice(), bytes.as_slice())?;
                index.insert(id.as_slice(), seq_key.as_slice())?;
                local.insert(local_key.as_slice(), Vec::<u8>::new())?;
                Ok(())
            });
        result.map_err(|err| match err {
            TransactionError::Storage(e) => sled_error(e),
            TransactionError::Abort(()) => SledStorageError::Aborted(format!("publishing {}", txn.id)).into(),
        })?;
        debug!("{} published {} as #{}", self.peer, txn.id, seq);
        Ok(seq)
    }

    fn published_through_blocking(&self, horizon: u64) -> Result<Vec<TxnPeerId>, StorageError> {
        let mut ids = Vec::new();
        for entry in self.store.published.range(..=horizon.to_be_bytes()) {
            let (_, bytes) = entry.map_err(sled_error)?;
            let txn: Transaction = bincode::deserialize(&bytes)?;
            ids.push(txn.id);
        }
        Ok(ids)
    }

    fn local_transactions_at_blocking(&self, recno: Recno) -> Result<Vec<Transaction>, StorageError> {
        let mut txns = Vec::new();
        for entry in self.local.scan_prefix(recno_key(recno)) {
            let (key, _) = entry.map_err(sled_error)?;
            let seq = decode_seq(&key[4..])?;
            let bytes = self.store.published.get(seq.to_be_bytes()).map_err(sled_error)?.ok_or_else(|| {
                StorageError::BackendError(format!("local publication #{} missing from the shared store", seq).into())
            })?;
            txns.push(bincode::deserialize(&bytes)?);
        }
        Ok(txns)
    }

    fn read_decisions(bytes: Option<sled::IVec>) -> Result<Vec<Decision>, StorageError> {
        match bytes {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn record_decisions_blocking(&self, recno: Recno, decisions: &[Decision]) -> Result<(), StorageError> {
        let key = recno_key(recno);
        let mut recorded = Self::read_decisions(self.decisions.get(key).map_err(sled_error)?)?;
        recorded.extend(decisions.iter().cloned());
        self.decisions.insert(key, bincode::serialize(&recorded)?).map_err(sled_error)?;
        Ok(())
    }

    fn finish_round_blocking(&self, record: RoundRecord) -> Result<(), StorageError> {
        let expected = self.current_round_blocking()? + 1;
        if record.recno != expected {
            return Err(StorageError::OutOfOrderRound { expected, found: record.recno });
        }
        self.rounds.insert(recno_key(record.recno), bincode::serialize(&record)?).map_err(sled_error)?;
        self.store.db.flush().map_err(sled_error)?;
        Ok(())
    }

    fn round_record_blocking(&self, recno: Recno) -> Result<Option<RoundRecord>, StorageError> {
        match self.rounds.get(recno_key(recno)).map_err(sled_error)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn decisions_through_blocking(&self, recno: Recno) -> Result<Vec<Decision>, StorageError> {
        let mut decisions = Vec::new();
        for entry in self.decisions.range(..=recno_key(recno)) {
            let (_, bytes) = entry.map_err(sled_error)?;
            decisions.extend(Self::read_decisions(Some(bytes))?);
        }
        Ok(decisions)
    }

    fn rewind_to_blocking(&self, recno: Recno) -> Result<(), StorageError> {
        for tree in [&self.decisions, &self.rounds] {
            let doomed: Vec<sled::IVec> =
                tree.range(recno_key(recno + 1)..).keys().collect::<Result<_, _>>().map_err(sled_error)?;
            for key in doomed {
                tree.remove(key).map_err(sled_error)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateLog for SledLog {
    fn peer(&self) -> &PeerId { &self.peer }

    // stubs call out to their blocking counterparts, since sled calls may block
    async fn current_round(&self) -> Result<Recno, StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.current_round_blocking()).await?
    }

    async fn horizon(&self) -> Result<u64, StorageError> {
        let store = self.store.clone();
        task::spawn_blocking(move || store.horizon_blocking()).await?
    }

    async fn next_transaction_id(&self) -> Result<TxnPeerId, StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.next_transaction_id_blocking()).await?
    }

    async fn publish(&self, recno: Recno, txn: &Transaction) -> Result<u64, StorageError> {
        let me = self.clone();
        let txn = txn.clone();
        task::spawn_blocking(move || me.publish_blocking(recno, &txn)).await?
    }

    async fn lookup(&self, id: &TxnPeerId) -> Result<Option<(u64, Transaction)>, StorageError> {
        let store = self.store.clone();
        let id = id.clone();
        task::spawn_blocking(move || store.lookup_blocking(&id)).await?
    }

    async fn published_through(&self, horizon: u64) -> Result<Vec<TxnPeerId>, StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.published_through_blocking(horizon)).await?
    }

    async fn local_transactions_at(&self, recno: Recno) -> Result<Vec<Transaction>, StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.local_transactions_at_blocking(recno)).await?
    }

    async fn record_decisions(&self, recno: Recno, decisions: &[Decision]) -> Result<(), StorageError> {
        let me = self.clone();
        let decisions = decisions.to_vec();
        task::spawn_blocking(move || me.record_decisions_blocking(recno, &decisions)).await?
    }

    async fn finish_round(&self, record: RoundRecord) -> Result<(), StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.finish_round_blocking(record)).await?
    }

    async fn round_record(&self, recno: Recno) -> Result<Option<RoundRecord>, StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.round_record_blocking(recno)).await?
    }

    async fn decisions_at(&self, recno: Recno) -> Result<Vec<Decision>, StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || Self::read_decisions(me.decisions.get(recno_key(recno)).map_err(sled_error)?)).await?
    }

    async fn decisions_through(&self, recno: Recno) -> Result<Vec<Decision>, StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.decisions_through_blocking(recno)).await?
    }

    async fn rewind_to(&self, recno: Recno) -> Result<(), StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.rewind_to_blocking(recno)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_core::trust::TrustConditions;
    use orchestra_proto::{tuple, Update};

    fn txn(id: TxnPeerId, value: &str) -> Transaction {
        Transaction::new(id.clone(), vec![Update::insertion(tuple!("R", 1; 1, value), id)])
    }

    #[tokio::test]
    async fn test_publications_are_shared_and_ordered() -> anyhow::Result<()> {
        let store = SledUpdateStore::new_test()?;
        let a = store.log("A")?;
        let b = store.log("B")?;

        let t1 = a.next_transaction_id().await?;
        let t2 = a.next_transaction_id().await?;
        assert_eq!((t1.tid, t2.tid), (1, 2));

        assert_eq!(a.publish(1, &txn(t1.clone(), "x")).await?, 1);
        assert_eq!(a.publish(1, &txn(t2.clone(), "y")).await?, 2);
        assert!(matches!(a.publish(1, &txn(t1.clone(), "x")).await, Err(StorageError::DuplicateTransaction(_))));

        assert_eq!(b.horizon().await?, 2);
        assert_eq!(b.published_through(1).await?, vec![t1.clone()]);
        assert_eq!(b.lookup(&t2).await?.map(|(seq, _)| seq), Some(2));
        assert_eq!(a.local_transactions_at(1).await?.len(), 2);
        assert!(b.local_transactions_at(1).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_rounds_and_rewind() -> anyhow::Result<()> {
        let store = SledUpdateStore::new_test()?;
        let log = store.log("B")?;
        let t = TxnPeerId::new(1, "A");

        log.record_decisions(1, &[Decision::accept(t.clone(), 1)]).await?;
        log.finish_round(RoundRecord::new(1, 0, TrustConditions::new("B", []))).await?;
        log.record_decisions(2, &[Decision::reject(TxnPeerId::new(2, "A"), 2)]).await?;
        log.finish_round(RoundRecord::new(2, 0, TrustConditions::new("B", []))).await?;
        assert!(matches!(log.finish_round(RoundRecord::new(4, 0, TrustConditions::new("B", []))).await, Err(StorageError::OutOfOrderRound { expected: 3, found: 4 })));

        assert_eq!(log.current_round().await?, 2);
        assert_eq!(log.decisions_through(2).await?.len(), 2);

        log.rewind_to(1).await?;
        assert_eq!(log.current_round().await?, 1);
        assert_eq!(log.decisions_through(9).await?, vec![Decision::accept(t, 1)]);
        assert_eq!(log.round_record(2).await?, None);
        Ok(())
    }
}

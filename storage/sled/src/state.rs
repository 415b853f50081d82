use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use orchestra_core::{
    error::StorageError,
    storage::{stage_updates, StateStore, Version},
};
use orchestra_proto::{Key, PeerId, Recno, Tuple, TxnPeerId, Update};
use sled::{Batch, Db, Tree};
use tokio::task;
use tracing::debug;

use crate::{
    error::sled_error,
    store::{decode_recno, recno_key},
};

const ROUND: &[u8] = b"round";

/// Versioned snapshot of one peer's replica.
///
/// Versions live under `key bytes ++ recno`, so all versions of a key are adjacent and ordered by round. Key bytes
/// are self-delimiting, so no key's prefix range overlaps another's.
#[derive(Clone)]
pub struct SledStateStore {
    versions: Tree,
    meta: Tree,
}

fn version_key(key_bytes: &[u8], round: Recno) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(key_bytes.len() + 4);
    bytes.extend_from_slice(key_bytes);
    bytes.extend_from_slice(&recno_key(round));
    bytes
}

fn split_version_key(bytes: &[u8]) -> Result<Recno, StorageError> {
    if bytes.len() < 4 {
        return Err(StorageError::BackendError(format!("version key of {} bytes", bytes.len()).into()));
    }
    decode_recno("versions", &bytes[bytes.len() - 4..])
}

impl SledStateStore {
    pub(crate) fn open(db: &Db, peer: &PeerId) -> anyhow::Result<Self> {
        Ok(Self { versions: db.open_tree(format!("state_{}_versions", peer))?, meta: db.open_tree(format!("state_{}_meta", peer))? })
    }

    fn current_round_blocking(&self) -> Result<Recno, StorageError> {
        match self.meta.get(ROUND).map_err(sled_error)? {
            Some(bytes) => decode_recno("meta", &bytes),
            None => Ok(0),
        }
    }

    fn version_blocking(&self, round: Recno, key: &Key) -> Result<Option<Version>, StorageError> {
        let key_bytes = key.to_bytes()?;
        match self.versions.range(version_key(&key_bytes, 0)..=version_key(&key_bytes, round)).next_back() {
            Some(entry) => {
                let (_, bytes) = entry.map_err(sled_error)?;
                let (_, version): (Key, Version) = bincode::deserialize(&bytes)?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    fn apply_blocking(&self, round: Recno, updates: &[Update]) -> Result<(), StorageError> {
        let current = self.current_round_blocking()?;
        if round != current + 1 {
            return Err(StorageError::RoundUnavailable { requested: round, current });
        }
        let staged = stage_updates(updates, |key| Ok(self.version_blocking(round, key)?.and_then(|v| v.value)))?;

        let mut batch = Batch::default();
        for (key, version) in staged {
            let bytes = version_key(&key.to_bytes()?, round);
            batch.insert(bytes, bincode::serialize(&(key, version))?);
        }
        self.versions.apply_batch(batch).map_err(sled_error)
    }

    fn advance_round_blocking(&self) -> Result<Recno, StorageError> {
        let next = self.current_round_blocking()? + 1;
        self.meta.insert(ROUND, recno_key(next).to_vec()).map_err(sled_error)?;
        self.versions.flush().map_err(sled_error)?;
        Ok(next)
    }

    fn rewind_to_blocking(&self, round: Recno) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        let mut dropped = 0;
        for entry in self.versions.iter().keys() {
            let key = entry.map_err(sled_error)?;
            if split_version_key(&key)? > round {
                batch.remove(key);
                dropped += 1;
            }
        }
        self.versions.apply_batch(batch).map_err(sled_error)?;
        if self.current_round_blocking()? > round {
            self.meta.insert(ROUND, recno_key(round).to_vec()).map_err(sled_error)?;
        }
        debug!("rewound state to round {}, dropping {} versions", round, dropped);
        Ok(())
    }

    fn dump_blocking(&self, round: Recno) -> Result<Vec<Tuple>, StorageError> {
        let mut latest: BTreeMap<Key, Option<Tuple>> = BTreeMap::new();
        for entry in self.versions.iter() {
            let (key, bytes) = entry.map_err(sled_error)?;
            if split_version_key(&key)? > round {
                continue;
            }
            // versions of a key arrive in round order, so the last one wins
            let (key, version): (Key, Version) = bincode::deserialize(&bytes)?;
            latest.insert(key, version.value);
        }
        Ok(latest.into_values().flatten().collect())
    }
}

#[async_trait]
impl StateStore for SledStateStore {
    async fn current_round(&self) -> Result<Recno, StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.current_round_blocking()).await?
    }

    async fn get_by_key(&self, round: Recno, key: &Key) -> Result<Option<Tuple>, StorageError> {
        let me = self.clone();
        let key = key.clone();
        Ok(task::spawn_blocking(move || me.version_blocking(round, &key)).await??.and_then(|v| v.value))
    }

    async fn writers(&self, round: Recno, key: &Key) -> Result<BTreeSet<TxnPeerId>, StorageError> {
        let me = self.clone();
        let key = key.clone();
        Ok(task::spawn_blocking(move || me.version_blocking(round, &key)).await??.map(|v| v.writers).unwrap_or_default())
    }

    async fn apply(&self, round: Recno, updates: &[Update]) -> Result<(), StorageError> {
        let me = self.clone();
        let updates = updates.to_vec();
        task::spawn_blocking(move || me.apply_blocking(round, &updates)).await?
    }

    async fn advance_round(&self) -> Result<Recno, StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.advance_round_blocking()).await?
    }

    async fn rewind_to(&self, round: Recno) -> Result<(), StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.rewind_to_blocking(round)).await?
    }

    async fn dump(&self, round: Recno) -> Result<Vec<Tuple>, StorageError> {
        let me = self.clone();
        task::spawn_blocking(move || me.dump_blocking(round)).await?
    }
}

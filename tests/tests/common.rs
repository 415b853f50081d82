use std::sync::Arc;

use orchestra::{
    proto::{tuple, Key, Tuple, TxnPeerId},
    storage::memory::{MemoryStateStore, MemoryUpdateStore},
    Change, Peer, ReconcilerConfig,
};
use orchestra_storage_sled::SledUpdateStore;
use tracing::Level;

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() { tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().init(); }

pub fn r(k: i64, v: &str) -> Tuple { tuple!("R", 1; k, v) }

pub fn key(k: i64) -> Key { tuple!("R", 1; k).key() }

pub fn tid(n: u32, peer: &str) -> TxnPeerId { TxnPeerId::new(n, peer) }

pub fn memory_peer(store: &MemoryUpdateStore, name: &str) -> Peer {
    Peer::new(Arc::new(store.log(name)), Arc::new(MemoryStateStore::new()), ["R".into()], ReconcilerConfig::default())
}

#[allow(unused)]
pub fn sled_peer(store: &SledUpdateStore, name: &str) -> anyhow::Result<Peer> {
    Ok(Peer::new(Arc::new(store.log(name)?), Arc::new(store.state(name)?), ["R".into()], ReconcilerConfig::default()))
}

#[allow(unused)]
pub fn insert(k: i64, v: &str) -> Vec<Change> { vec![Change::Insert(r(k, v))] }

#[allow(unused)]
pub fn modify(k: i64, old: &str, new: &str) -> Vec<Change> { vec![Change::Modify { old: r(k, old), new: r(k, new) }] }

/// Peers A, B, C, D where B and D trust A and D at priority 5 and nobody trusts C
pub struct Quartet {
    pub a: Peer,
    pub b: Peer,
    pub c: Peer,
    pub d: Peer,
}

impl Quartet {
    pub async fn new(peer: impl Fn(&str) -> anyhow::Result<Peer>) -> anyhow::Result<Self> {
        let quartet = Self { a: peer("A")?, b: peer("B")?, c: peer("C")?, d: peer("D")? };
        for trusting in [&quartet.b, &quartet.d] {
            trusting.add_trust_condition("A", "R", 5, None).await?;
            trusting.add_trust_condition("D", "R", 5, None).await?;
        }
        Ok(quartet)
    }

    /// Runs the example rounds up to the UPDATE conflict at B:
    /// 1. A inserts (1,"x"); B accepts it
    /// 2. C inserts (1,"y"); B ignores it
    /// 3. A moves x to "z" while D, having accepted A's insert, moves it to "w"; B defers both
    #[allow(unused)]
    pub async fn up_to_conflict(&self) -> anyhow::Result<()> {
        self.a.publish(insert(1, "x")).await?;
        self.b.reconcile().await?;
        self.c.publish(insert(1, "y")).await?;
        self.b.reconcile().await?;
        self.d.reconcile().await?;
        self.a.publish(modify(1, "x", "z")).await?;
        self.d.publish(modify(1, "x", "w")).await?;
        self.b.reconcile().await?;
        Ok(())
    }
}

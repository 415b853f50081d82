//! # Orchestra
//!
//! Peers keep independent replicas of shared relations and periodically reconcile: each trusted remote
//! transaction is accepted, rejected, or deferred until an outside party settles the conflict it is part of.
//!
//! ## Core Concepts
//!
//! - **Update**: a change to one tuple, carrying the transactions that produced it and the ones it builds on
//! - **Trust conditions**: per relation, which peers a peer trusts and with what priority
//! - **Round**: one reconciliation pass over everything published since the last one
//! - **Conflict**: equally trusted transactions that cannot all be applied; they wait for a resolution
//!
//! ## Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use orchestra::{proto::tuple, storage::memory::{MemoryStateStore, MemoryUpdateStore}, Change, Peer, ReconcilerConfig};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryUpdateStore::new();
//! let alice = Peer::new(Arc::new(store.log("alice")), Arc::new(MemoryStateStore::new()), ["R".into()], ReconcilerConfig::default());
//! let bob = Peer::new(Arc::new(store.log("bob")), Arc::new(MemoryStateStore::new()), ["R".into()], ReconcilerConfig::default());
//! bob.add_trust_condition("alice", "R", 5, None).await?;
//!
//! alice.publish(vec![Change::Insert(tuple!("R", 1; 1, "x"))]).await?;
//! let outcome = bob.reconcile().await?;
//!
//! assert_eq!(outcome.accepted().len(), 1);
//! assert_eq!(bob.get(&tuple!("R", 1; 1).key()).await?, Some(tuple!("R", 1; 1, "x")));
//! # Ok(())
//! # }
//! ```

pub use orchestra_core::*;

#[cfg(feature = "sled")]
pub use orchestra_storage_sled as sled;

/// Load a [`ReconcilerConfig`] from a JSON file, falling back to defaults for anything it leaves out
pub fn load_config(path: impl AsRef<std::path::Path>) -> Result<ReconcilerConfig, Box<dyn std::error::Error + Send + Sync>> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let config: ReconcilerConfig = serde_json::from_str(&text)?;
    tracing::debug!("loaded reconciler config from {}: {:?}", path.as_ref().display(), config);
    Ok(config)
}

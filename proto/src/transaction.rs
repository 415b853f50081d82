use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{id::TxnPeerId, update::Update};

/// A transaction as published to the shared update store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnPeerId,
    pub updates: Vec<Update>,
}

impl Transaction {
    pub fn new(id: TxnPeerId, updates: Vec<Update>) -> Self { Self { id, updates } }

    /// Union of the antecedent ids of all member updates, excluding the transaction itself
    pub fn antecedents(&self) -> BTreeSet<TxnPeerId> {
        self.updates.iter().flat_map(|u| u.prev_tids().iter()).filter(|tid| **tid != self.id).cloned().collect()
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transaction({} {})", self.id, self.updates.iter().map(|u| u.to_string()).collect::<Vec<_>>().join("; "))
    }
}

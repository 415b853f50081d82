use std::collections::{BTreeMap, BTreeSet};

use orchestra_proto::{Initial, Key, Tuple, TxnPeerId, Update};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictKind;

/// What a conflict is about: the old value being replaced, the key being claimed, or the initial fact the
/// competing updates descend from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConflictIndex {
    Update(Tuple),
    Key(Key),
    Initial(Initial),
}

impl ConflictIndex {
    /// Index of a conflict of `kind` that `update` takes part in
    pub fn of(kind: ConflictKind, update: &Update) -> Option<Self> {
        match kind {
            ConflictKind::Update => update.old().cloned().map(ConflictIndex::Update),
            ConflictKind::Key => update.new_key().map(ConflictIndex::Key),
            ConflictKind::Initial => update.initial().cloned().map(ConflictIndex::Initial),
        }
    }

    pub fn kind(&self) -> ConflictKind {
        match self {
            ConflictIndex::Update(_) => ConflictKind::Update,
            ConflictIndex::Key(_) => ConflictKind::Key,
            ConflictIndex::Initial(_) => ConflictKind::Initial,
        }
    }
}

/// One competing update value, with the deferred transactions proposing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictOption {
    pub update: Update,
    pub txns: BTreeSet<TxnPeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub id: usize,
    pub index: ConflictIndex,
    pub options: Vec<ConflictOption>,
}

impl Conflict {
    pub fn kind(&self) -> ConflictKind { self.index.kind() }

    pub fn option(&self, option: usize) -> Option<&ConflictOption> { self.options.get(option) }

    /// Every transaction named by any option
    pub fn txns(&self) -> BTreeSet<TxnPeerId> { self.options.iter().flat_map(|o| o.txns.iter().cloned()).collect() }
}

/// The conflicts found in one round. Conflicts and options are addressed by position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictSet {
    conflicts: Vec<Conflict>,
    by_index: BTreeMap<ConflictIndex, usize>,
}

impl ConflictSet {
    pub fn new() -> Self { Self::default() }

    /// Record that `txn` proposes `update` for the conflict at `index`. An option with the same old and new value is
    /// reused. Returns the conflict id and option position.
    pub fn register(&mut self, index: ConflictIndex, update: &Update, txn: &TxnPeerId) -> (usize, usize) {
        let id = match self.by_index.get(&index) {
            Some(id) => *id,
            None => {
                let id = self.conflicts.len();
                self.conflicts.push(Conflict { id, index: index.clone(), options: Vec::new() });
                self.by_index.insert(index, id);
                id
            }
        };
        let conflict = &mut self.conflicts[id];
        let position = match conflict.options.iter().position(|o| o.update.value_eq(update)) {
            Some(position) => position,
            None => {
                conflict.options.push(ConflictOption { update: update.clone(), txns: BTreeSet::new() });
                conflict.options.len() - 1
            }
        };
        conflict.options[position].txns.insert(txn.clone());
        (id, position)
    }

    pub fn get(&self, id: usize) -> Option<&Conflict> { self.conflicts.get(id) }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> { self.conflicts.iter() }

    pub fn len(&self) -> usize { self.conflicts.len() }

    pub fn is_empty(&self) -> bool { self.conflicts.is_empty() }
}

use std::collections::{BTreeMap, BTreeSet};

use orchestra_proto::{Key, Recno, RelationId};

/// Keys touched by deferred transactions, with the rounds in which they were touched.
///
/// A key is dirty at round `r` when it carries a mark at or before `r`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyTracker {
    marks: BTreeMap<RelationId, BTreeMap<Key, BTreeSet<Recno>>>,
}

impl DirtyTracker {
    pub fn new() -> Self { Self::default() }

    pub fn mark(&mut self, key: Key, recno: Recno) {
        self.marks.entry(key.relation.clone()).or_default().entry(key).or_default().insert(recno);
    }

    pub fn is_dirty(&self, key: &Key, recno: Recno) -> bool {
        self.marks.get(&key.relation).and_then(|keys| keys.get(key)).is_some_and(|rounds| rounds.range(..=recno).next().is_some())
    }

    /// Drop every mark made at or after `recno`
    pub fn clear_from(&mut self, recno: Recno) {
        for keys in self.marks.values_mut() {
            for rounds in keys.values_mut() {
                rounds.retain(|r| *r < recno);
            }
            keys.retain(|_, rounds| !rounds.is_empty());
        }
        self.marks.retain(|_, keys| !keys.is_empty());
    }

    pub fn is_empty(&self) -> bool { self.marks.is_empty() }
}

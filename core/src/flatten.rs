//! Collapsing per-statement updates into one net update per key.

use std::collections::{BTreeMap, BTreeSet};

use orchestra_proto::{Initial, Key, Update, UpdateDraft, UpdateKind};

use crate::error::FlattenError;

/// Folds updates, in arrival order, into the minimal equivalent set of net updates.
///
/// Deletions (and insert-then-delete placeholders) are terminal: they are emitted as soon as they are formed and
/// their key may not be touched again by the same flattening.
#[derive(Debug, Default)]
pub struct Flattener {
    slots: Vec<Option<UpdateDraft>>,
    /// current key -> slot of the open update leaving a value there
    open: BTreeMap<Key, usize>,
    emitted: Vec<UpdateDraft>,
    closed: BTreeSet<Key>,
}

impl Flattener {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, update: &Update) -> Result<(), FlattenError> {
        let mut draft = update.draft();
        if draft.initial.is_none() {
            if let (Some(value), Some(tid)) = (draft.old.clone().or_else(|| draft.new.clone()), draft.tids.iter().next().cloned()) {
                draft.initial = Some(Initial::new(value, tid));
            }
        }

        let subject = update.subject_key();
        if self.closed.contains(&subject) {
            return Err(FlattenError::ModifiedAfterDelete(subject));
        }
        if let Some(new_key) = update.new_key() {
            if new_key != subject && self.closed.contains(&new_key) {
                return Err(FlattenError::ModifiedAfterDelete(new_key));
            }
        }

        match self.open.get(&subject).copied() {
            None => self.start(subject, update.kind(), draft),
            Some(slot) => self.fold(subject, slot, update.kind(), draft),
        }
    }

    fn start(&mut self, subject: Key, kind: UpdateKind, draft: UpdateDraft) -> Result<(), FlattenError> {
        match kind {
            UpdateKind::Deletion | UpdateKind::Placeholder => {
                self.emitted.push(draft);
                self.closed.insert(subject);
            }
            UpdateKind::Insertion | UpdateKind::Modification => {
                let key = draft.new.as_ref().map(|t| t.key()).unwrap_or(subject);
                if self.open.contains_key(&key) {
                    return Err(FlattenError::KeyCollision(key));
                }
                self.open.insert(key, self.slots.len());
                self.slots.push(Some(draft));
            }
        }
        Ok(())
    }

    fn fold(&mut self, subject: Key, slot: usize, kind: UpdateKind, next: UpdateDraft) -> Result<(), FlattenError> {
        let Some(current) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
            return Err(FlattenError::Inconsistent { key: subject, expected: None, found: next.old });
        };

        match kind {
            UpdateKind::Insertion if current.old.is_none() && current.new == next.new => {}
            UpdateKind::Insertion if current.old.is_none() => {
                return Err(FlattenError::Inconsistent { key: subject, expected: current.new.clone(), found: next.new });
            }
            UpdateKind::Insertion => return Err(FlattenError::InsertOverExisting(subject)),
            UpdateKind::Placeholder => return Err(FlattenError::Inconsistent { key: subject, expected: current.new.clone(), found: None }),
            UpdateKind::Modification | UpdateKind::Deletion if current.new != next.old => {
                return Err(FlattenError::Inconsistent { key: subject, expected: current.new.clone(), found: next.old });
            }
            UpdateKind::Modification | UpdateKind::Deletion => current.new = next.new.clone(),
        }
        current.tids.extend(next.tids);
        current.prev_tids.extend(next.prev_tids);

        match kind {
            UpdateKind::Modification => {
                let Some(new_key) = next.new.as_ref().map(|t| t.key()) else { return Ok(()) };
                if new_key != subject {
                    if self.open.contains_key(&new_key) {
                        return Err(FlattenError::KeyCollision(new_key));
                    }
                    self.open.remove(&subject);
                    self.open.insert(new_key, slot);
                }
            }
            // insert∘delete leaves a placeholder, update∘delete a deletion of the original value; both are
            // terminal
            UpdateKind::Deletion => {
                self.open.remove(&subject);
                if let Some(done) = self.slots.get_mut(slot).and_then(Option::take) {
                    self.emitted.push(done);
                }
                self.closed.insert(subject);
            }
            _ => {}
        }
        Ok(())
    }

    /// Net updates: deletions and placeholders first, then modifications, then insertions.
    pub fn finish(self) -> Result<Vec<Update>, FlattenError> {
        let mut updates = Vec::with_capacity(self.open.len() + self.emitted.len());
        for mut draft in self.slots.into_iter().flatten().chain(self.emitted) {
            let tids = draft.tids.clone();
            draft.prev_tids.retain(|tid| !tids.contains(tid));
            updates.push(draft.publish()?);
        }
        updates.sort_by_key(|u| match u.kind() {
            UpdateKind::Deletion | UpdateKind::Placeholder => 0,
            UpdateKind::Modification => 1,
            UpdateKind::Insertion => 2,
        });
        Ok(updates)
    }
}

pub fn flatten<'a>(updates: impl IntoIterator<Item = &'a Update>) -> Result<Vec<Update>, FlattenError> {
    let mut flattener = Flattener::new();
    for update in updates {
        flattener.push(update)?;
    }
    flattener.finish()
}

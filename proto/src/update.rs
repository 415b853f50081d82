use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::{
    id::TxnPeerId,
    tuple::{Key, RelationId, Tuple},
};

/// The value and transaction id of whichever transaction first touched a key in the history an update was
/// built from. Two updates descending from the same initial fact can conflict even when neither carries an
/// old value (see INITIAL conflicts).
#[derive(Debug, PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Initial {
    pub value: Tuple,
    pub tid: TxnPeerId,
}

impl Initial {
    pub fn new(value: Tuple, tid: TxnPeerId) -> Self { Self { value, tid } }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash)]
pub enum UpdateKind {
    Insertion,
    Deletion,
    Modification,
    /// Inserted then deleted within the same causal history; retained only for provenance
    Placeholder,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("placeholder update without an initial value")]
    EmptyPlaceholder,
    #[error("old value relation {old} differs from new value relation {new}")]
    RelationMismatch { old: RelationId, new: RelationId },
}

/// A published update: `(old?, new?)` plus provenance bookkeeping.
///
/// Published updates are immutable. Derived values are built with the `with_*` constructors or by
/// round-tripping through [`UpdateDraft`].
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(try_from = "UpdateDraft", into = "UpdateDraft")]
pub struct Update {
    old: Option<Tuple>,
    new: Option<Tuple>,
    tids: BTreeSet<TxnPeerId>,
    prev_tids: BTreeSet<TxnPeerId>,
    initial: Option<Initial>,
}

/// Mutable form of an [`Update`], used while folding or assembling updates
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct UpdateDraft {
    pub old: Option<Tuple>,
    pub new: Option<Tuple>,
    pub tids: BTreeSet<TxnPeerId>,
    pub prev_tids: BTreeSet<TxnPeerId>,
    pub initial: Option<Initial>,
}

impl UpdateDraft {
    pub fn publish(self) -> Result<Update, UpdateError> {
        if let (Some(old), Some(new)) = (&self.old, &self.new) {
            if old.relation() != new.relation() {
                return Err(UpdateError::RelationMismatch { old: old.relation().clone(), new: new.relation().clone() });
            }
        }
        if self.old.is_none() && self.new.is_none() && self.initial.is_none() {
            return Err(UpdateError::EmptyPlaceholder);
        }
        Ok(Update { old: self.old, new: self.new, tids: self.tids, prev_tids: self.prev_tids, initial: self.initial })
    }
}

impl TryFrom<UpdateDraft> for Update {
    type Error = UpdateError;
    fn try_from(draft: UpdateDraft) -> Result<Self, Self::Error> { draft.publish() }
}

impl From<Update> for UpdateDraft {
    fn from(update: Update) -> Self { update.into_draft() }
}

impl Update {
    pub fn insertion(new: Tuple, tid: TxnPeerId) -> Self {
        Self { old: None, new: Some(new), tids: BTreeSet::from([tid]), prev_tids: BTreeSet::new(), initial: None }
    }

    pub fn deletion(old: Tuple, tid: TxnPeerId) -> Self {
        Self { old: Some(old), new: None, tids: BTreeSet::from([tid]), prev_tids: BTreeSet::new(), initial: None }
    }

    /// # Panics
    /// In debug builds, if `old` and `new` belong to different relations.
    pub fn modification(old: Tuple, new: Tuple, tid: TxnPeerId) -> Self {
        debug_assert_eq!(old.relation(), new.relation());
        Self { old: Some(old), new: Some(new), tids: BTreeSet::from([tid]), prev_tids: BTreeSet::new(), initial: None }
    }

    pub fn old(&self) -> Option<&Tuple> { self.old.as_ref() }

    pub fn new_value(&self) -> Option<&Tuple> { self.new.as_ref() }

    pub fn tids(&self) -> &BTreeSet<TxnPeerId> { &self.tids }

    pub fn prev_tids(&self) -> &BTreeSet<TxnPeerId> { &self.prev_tids }

    pub fn initial(&self) -> Option<&Initial> { self.initial.as_ref() }

    pub fn kind(&self) -> UpdateKind {
        match (&self.old, &self.new) {
            (None, Some(_)) => UpdateKind::Insertion,
            (Some(_), None) => UpdateKind::Deletion,
            (Some(_), Some(_)) => UpdateKind::Modification,
            (None, None) => UpdateKind::Placeholder,
        }
    }

    pub fn is_insertion(&self) -> bool { self.kind() == UpdateKind::Insertion }

    pub fn is_deletion(&self) -> bool { self.kind() == UpdateKind::Deletion }

    pub fn is_placeholder(&self) -> bool { self.kind() == UpdateKind::Placeholder }

    /// Every published update has at least one of old, new or initial value, so this always resolves
    fn any_tuple(&self) -> &Tuple {
        match (&self.new, &self.old, &self.initial) {
            (Some(t), _, _) | (None, Some(t), _) => t,
            (None, None, Some(initial)) => &initial.value,
            // unreachable for published updates; UpdateDraft::publish refuses this shape
            (None, None, None) => unreachable!("update without any tuple"),
        }
    }

    pub fn relation(&self) -> &RelationId { self.any_tuple().relation() }

    pub fn old_key(&self) -> Option<Key> { self.old.as_ref().map(Tuple::key) }

    pub fn new_key(&self) -> Option<Key> { self.new.as_ref().map(Tuple::key) }

    /// The key this update acts upon: its old key, or the inserted key, or for a placeholder the key of its initial value
    pub fn subject_key(&self) -> Key {
        match (&self.old, &self.new, &self.initial) {
            (Some(old), _, _) => old.key(),
            (None, Some(new), _) => new.key(),
            _ => self.any_tuple().key(),
        }
    }

    /// The key under which this update leaves a value (or for deletions, the key it frees)
    pub fn result_key(&self) -> Key {
        match (&self.new, &self.old) {
            (Some(new), _) => new.key(),
            (None, Some(old)) => old.key(),
            (None, None) => self.any_tuple().key(),
        }
    }

    /// All keys read or written by this update, deduplicated
    pub fn touched_keys(&self) -> Vec<Key> {
        let mut keys = Vec::with_capacity(2);
        if let Some(old) = &self.old {
            keys.push(old.key());
        }
        if let Some(new) = &self.new {
            let key = new.key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            keys.push(self.any_tuple().key());
        }
        keys
    }

    /// Equality on old/new values only, ignoring provenance bookkeeping
    pub fn value_eq(&self, other: &Update) -> bool { self.old == other.old && self.new == other.new }

    pub fn with_tids(self, tids: BTreeSet<TxnPeerId>) -> Self { Self { tids, ..self } }

    pub fn with_prev_tids(self, prev_tids: BTreeSet<TxnPeerId>) -> Self { Self { prev_tids, ..self } }

    pub fn with_initial(self, initial: Initial) -> Self { Self { initial: Some(initial), ..self } }

    pub fn into_draft(self) -> UpdateDraft {
        UpdateDraft { old: self.old, new: self.new, tids: self.tids, prev_tids: self.prev_tids, initial: self.initial }
    }

    pub fn draft(&self) -> UpdateDraft { self.clone().into_draft() }

    /// Whether this update depends on (has as an antecedent) any transaction that contributed to `other`
    pub fn depends_on(&self, other: &Update) -> bool { self.prev_tids.iter().any(|tid| other.tids.contains(tid)) }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.old, &self.new) {
            (None, Some(new)) => write!(f, "+{}", new)?,
            (Some(old), None) => write!(f, "-{}", old)?,
            (Some(old), Some(new)) => write!(f, "{} -> {}", old, new)?,
            (None, None) => write!(f, "~{}", self.any_tuple())?,
        }
        write!(f, " [{}]", self.tids.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" "))
    }
}

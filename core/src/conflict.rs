use orchestra_proto::Update;
use serde::{Deserialize, Serialize};

use crate::error::ConflictError;

/// The way two updates compete. A pair is tagged with at most one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Both replace the same old value with different outcomes
    Update,
    /// Both produce the same key with different content
    Key,
    /// Both descend from the same initial fact with different outcomes
    Initial,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::Update => write!(f, "UPDATE"),
            ConflictKind::Key => write!(f, "KEY"),
            ConflictKind::Initial => write!(f, "INITIAL"),
        }
    }
}

/// Classify a pair of updates. The result does not depend on argument order.
///
/// Fails when the updates belong to different relations, or when one inserts the key the other deletes:
/// flattened candidates can never legitimately look like that.
pub fn classify(u1: &Update, u2: &Update) -> Result<Option<ConflictKind>, ConflictError> {
    if u1.relation() != u2.relation() {
        return Err(ConflictError::DifferentRelations { left: u1.relation().clone(), right: u2.relation().clone() });
    }

    // two modifications of the same old value are an UPDATE conflict even when they also collide on the key
    let same_old_modifications = u1.new_value().is_some() && u2.new_value().is_some() && u1.old().is_some() && u1.old() == u2.old();

    if let (Some(n1), Some(n2)) = (u1.new_value(), u2.new_value()) {
        if n1.same_key(n2) && n1 != n2 && !same_old_modifications {
            return Ok(Some(ConflictKind::Key));
        }
    }

    for (ins, del) in [(u1, u2), (u2, u1)] {
        if let (true, true, Some(inserted), Some(deleted)) = (ins.is_insertion(), del.is_deletion(), ins.new_key(), del.old_key()) {
            if inserted == deleted {
                return Err(ConflictError::InsertDeleteSameKey(inserted));
            }
        }
    }

    if u1.old().is_some() && u1.old() == u2.old() && u1.new_value() != u2.new_value() {
        return Ok(Some(ConflictKind::Update));
    }

    if let (Some(i1), Some(i2)) = (u1.initial(), u2.initial()) {
        // a deletion and a placeholder both leave nothing behind
        if i1 == i2 && u1.new_value() != u2.new_value() {
            return Ok(Some(ConflictKind::Initial));
        }
    }

    Ok(None)
}

/// Whether two updates stand in a happened-before relationship or share a contributing transaction
pub fn related(u1: &Update, u2: &Update) -> bool {
    u1.depends_on(u2) || u2.depends_on(u1) || u1.tids().iter().any(|t| u2.tids().contains(t))
}

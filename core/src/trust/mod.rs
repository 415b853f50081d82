//! Trust priorities.
//!
//! A peer's [`TrustConditions`] map each relation to priority-ordered groups of conditions. A condition
//! names a trusted peer (or any peer) and optionally a predicate the tuple must satisfy. The priority of a
//! tuple is that of the highest group containing a matching condition; 0 means untrusted.

mod predicate;

pub use predicate::TuplePredicate;

use std::collections::{BTreeMap, BTreeSet};

use orchestra_proto::{PeerId, RelationId, Tuple, Update};
use serde::{Deserialize, Serialize};

use crate::{config::DEFAULT_MAX_PRIORITY, error::TrustError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustedPeer {
    Any,
    Peer(PeerId),
}

impl TrustedPeer {
    fn matches(&self, peer: &PeerId) -> bool {
        match self {
            TrustedPeer::Any => true,
            TrustedPeer::Peer(trusted) => trusted == peer,
        }
    }
}

impl From<&str> for TrustedPeer {
    fn from(peer: &str) -> Self { TrustedPeer::Peer(peer.into()) }
}

impl From<PeerId> for TrustedPeer {
    fn from(peer: PeerId) -> Self { TrustedPeer::Peer(peer) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustCondition {
    pub peer: TrustedPeer,
    pub predicate: Option<TuplePredicate>,
}

impl TrustCondition {
    fn matches(&self, peer: &PeerId, tuple: &Tuple) -> bool {
        self.peer.matches(peer) && self.predicate.as_ref().map_or(true, |p| p.evaluate(tuple))
    }
}

/// Trust rules owned by one peer. Cloning produces an independent copy; conditions are never shared
/// between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustConditions {
    owner: PeerId,
    max_priority: u32,
    relations: BTreeSet<RelationId>,
    /// relation -> priority -> conditions, scanned from the highest priority down
    conditions: BTreeMap<RelationId, BTreeMap<u32, Vec<TrustCondition>>>,
}

impl TrustConditions {
    pub fn new(owner: impl Into<PeerId>, relations: impl IntoIterator<Item = RelationId>) -> Self {
        Self::with_max_priority(owner, relations, DEFAULT_MAX_PRIORITY)
    }

    pub fn with_max_priority(owner: impl Into<PeerId>, relations: impl IntoIterator<Item = RelationId>, max_priority: u32) -> Self {
        Self { owner: owner.into(), max_priority, relations: relations.into_iter().collect(), conditions: BTreeMap::new() }
    }

    pub fn owner(&self) -> &PeerId { &self.owner }

    pub fn max_priority(&self) -> u32 { self.max_priority }

    /// Reserved priority of the owner's own transactions, above any configurable value
    pub fn own_priority(&self) -> u32 { self.max_priority.saturating_add(1) }

    pub fn relations(&self) -> impl Iterator<Item = &RelationId> { self.relations.iter() }

    pub fn add_trusted(
        &mut self,
        peer: impl Into<TrustedPeer>,
        relation: impl Into<RelationId>,
        priority: u32,
        predicate: Option<TuplePredicate>,
    ) -> Result<(), TrustError> {
        let relation = relation.into();
        if priority == 0 || priority > self.max_priority {
            return Err(TrustError::PriorityOutOfRange { priority, max: self.max_priority });
        }
        if !self.relations.contains(&relation) {
            return Err(TrustError::UnknownRelation(relation));
        }
        self.conditions.entry(relation).or_default().entry(priority).or_default().push(TrustCondition { peer: peer.into(), predicate });
        Ok(())
    }

    pub fn conditions(&self, relation: &RelationId) -> impl Iterator<Item = (u32, &TrustCondition)> {
        self.conditions.get(relation).into_iter().flat_map(|groups| groups.iter().rev()).flat_map(|(p, cs)| cs.iter().map(move |c| (*p, c)))
    }

    /// Priority with which the owner trusts `tuple` coming from `peer`
    pub fn tuple_priority(&self, peer: &PeerId, tuple: &Tuple) -> u32 {
        if *peer == self.owner {
            return self.own_priority();
        }
        match self.conditions.get(tuple.relation()) {
            None => 1,
            Some(groups) if groups.is_empty() => 1,
            Some(groups) => {
                for (priority, group) in groups.iter().rev() {
                    if group.iter().any(|c| c.matches(peer, tuple)) {
                        return *priority;
                    }
                }
                0
            }
        }
    }

    /// Highest priority over the update's old and new values. Placeholders are judged by their initial value.
    pub fn update_priority(&self, peer: &PeerId, update: &Update) -> u32 {
        let old = update.old().map(|t| self.tuple_priority(peer, t));
        let new = update.new_value().map(|t| self.tuple_priority(peer, t));
        match (old, new) {
            (None, None) => update.initial().map_or(0, |i| self.tuple_priority(peer, &i.value)),
            (old, new) => old.unwrap_or(0).max(new.unwrap_or(0)),
        }
    }

    /// Highest update priority, unless any single update is untrusted, in which case the whole transaction is
    pub fn transaction_priority<'a>(&self, peer: &PeerId, updates: impl IntoIterator<Item = &'a Update>) -> u32 {
        let mut priority = 0;
        for update in updates {
            let p = self.update_priority(peer, update);
            if p == 0 {
                return 0;
            }
            priority = priority.max(p);
        }
        priority
    }

    pub fn encode(&self) -> Result<Vec<u8>, TrustError> { Ok(bincode::serialize(self)?) }

    pub fn decode(bytes: &[u8]) -> Result<Self, TrustError> { Ok(bincode::deserialize(bytes)?) }
}

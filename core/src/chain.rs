//! Transaction chains: a transaction plus the closure of its undecided antecedents.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use orchestra_proto::{TxnPeerId, Update};
use tracing::debug;

use crate::{
    error::ChainError,
    flatten::Flattener,
    storage::{DecisionOracle, DecisionState, TxnSource},
};

/// The unit of acceptance. Every component is accepted or rejected together with the head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnChain {
    head: TxnPeerId,
    /// Flattened contents of every component, antecedents folded before their dependents
    contents: Vec<Update>,
    /// Antecedents that were not expanded: already accepted, or not available from the source
    tail: BTreeSet<TxnPeerId>,
    antecedents: BTreeMap<TxnPeerId, BTreeSet<TxnPeerId>>,
    dependents: BTreeMap<TxnPeerId, BTreeSet<TxnPeerId>>,
    /// Raw contents of the components, as published
    raw: BTreeMap<TxnPeerId, Vec<Update>>,
}

impl TxnChain {
    pub async fn build<S>(head: TxnPeerId, source: &S, oracle: &dyn DecisionOracle) -> Result<Self, ChainError>
    where S: TxnSource + ?Sized {
        let updates = source.get_txn(&head).await?.ok_or_else(|| ChainError::MissingHead(head.clone()))?;
        let mut chain = Self {
            head: head.clone(),
            contents: Vec::new(),
            tail: BTreeSet::new(),
            antecedents: BTreeMap::new(),
            dependents: BTreeMap::new(),
            raw: BTreeMap::from([(head.clone(), updates)]),
        };
        chain.expand(vec![head], source, oracle).await?;
        chain.fold()?;
        Ok(chain)
    }

    pub fn head(&self) -> &TxnPeerId { &self.head }

    pub fn contents(&self) -> &[Update] { &self.contents }

    pub fn tail(&self) -> &BTreeSet<TxnPeerId> { &self.tail }

    /// Head plus every antecedent reachable without crossing into the tail
    pub fn components(&self) -> impl Iterator<Item = &TxnPeerId> { self.raw.keys() }

    pub fn component_set(&self) -> BTreeSet<TxnPeerId> { self.raw.keys().cloned().collect() }

    pub fn contains(&self, id: &TxnPeerId) -> bool { self.raw.contains_key(id) }

    pub fn raw_txns(&self) -> impl Iterator<Item = (&TxnPeerId, &[Update])> { self.raw.iter().map(|(id, u)| (id, u.as_slice())) }

    pub fn antecedents_of(&self, id: &TxnPeerId) -> impl Iterator<Item = &TxnPeerId> { self.antecedents.get(id).into_iter().flatten() }

    pub fn dependents_of(&self, id: &TxnPeerId) -> impl Iterator<Item = &TxnPeerId> { self.dependents.get(id).into_iter().flatten() }

    /// Whether `descendant` transitively depends on `ancestor` within this chain's adjacency
    pub fn is_descendant_of(&self, descendant: &TxnPeerId, ancestor: &TxnPeerId) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&TxnPeerId> = self.antecedents_of(descendant).collect();
        while let Some(id) = queue.pop_front() {
            if id == ancestor {
                return true;
            }
            if seen.insert(id) {
                queue.extend(self.antecedents_of(id));
            }
        }
        false
    }

    /// Re-expand the tail, pulling in antecedents that have become available since the chain was built. Tail
    /// entries that are still unavailable, or already accepted, stay in the tail.
    pub async fn replace_tail_with_available_txns<S>(&mut self, source: &S, oracle: &dyn DecisionOracle) -> Result<bool, ChainError>
    where S: TxnSource + ?Sized {
        let mut seeds = Vec::new();
        for id in std::mem::take(&mut self.tail) {
            match oracle.decision(&id) {
                DecisionState::Accepted => {
                    self.tail.insert(id);
                }
                DecisionState::Rejected => return Err(ChainError::RejectedAntecedent { head: self.head.clone(), antecedent: id }),
                DecisionState::Undecided => match source.get_txn(&id).await? {
                    Some(updates) => {
                        self.raw.insert(id.clone(), updates);
                        seeds.push(id);
                    }
                    None => {
                        self.tail.insert(id);
                    }
                },
            }
        }
        if seeds.is_empty() {
            return Ok(false);
        }
        debug!("chain {} topped up with {} transactions", self.head, seeds.len());
        self.expand(seeds, source, oracle).await?;
        self.fold()?;
        Ok(true)
    }

    /// Breadth-first expansion from `frontier`, whose contents are already in `raw`
    async fn expand<S>(&mut self, frontier: Vec<TxnPeerId>, source: &S, oracle: &dyn DecisionOracle) -> Result<(), ChainError>
    where S: TxnSource + ?Sized {
        let mut queue: VecDeque<TxnPeerId> = frontier.into();
        while let Some(id) = queue.pop_front() {
            let antecedents: BTreeSet<TxnPeerId> = self
                .raw
                .get(&id)
                .into_iter()
                .flatten()
                .flat_map(|u| u.prev_tids().iter())
                .filter(|ante| **ante != id)
                .cloned()
                .collect();
            for ante in antecedents {
                self.antecedents.entry(id.clone()).or_default().insert(ante.clone());
                self.dependents.entry(ante.clone()).or_default().insert(id.clone());
                if self.raw.contains_key(&ante) || self.tail.contains(&ante) {
                    continue;
                }
                match oracle.decision(&ante) {
                    DecisionState::Accepted => {
                        self.tail.insert(ante);
                    }
                    DecisionState::Rejected => return Err(ChainError::RejectedAntecedent { head: self.head.clone(), antecedent: ante }),
                    DecisionState::Undecided => match source.get_txn(&ante).await? {
                        Some(updates) => {
                            self.raw.insert(ante.clone(), updates);
                            queue.push_back(ante);
                        }
                        None => {
                            self.tail.insert(ante);
                        }
                    },
                }
            }
        }
        Ok(())
    }

    /// Fold the components in dependency order. Among transactions that are ready at the same time, id order
    /// decides.
    fn fold(&mut self) -> Result<(), ChainError> {
        self.contents = self.folded_contents()?;
        Ok(())
    }

    fn folded_contents(&self) -> Result<Vec<Update>, ChainError> {
        let mut pending: BTreeMap<&TxnPeerId, usize> = self
            .raw
            .keys()
            .map(|id| (id, self.antecedents_of(id).filter(|ante| self.raw.contains_key(*ante)).count()))
            .collect();
        let mut ready: BTreeSet<&TxnPeerId> = pending.iter().filter(|(_, n)| **n == 0).map(|(id, _)| *id).collect();
        let mut flattener = Flattener::new();
        let mut folded = 0;

        while let Some(id) = ready.pop_first() {
            pending.remove(id);
            for update in self.raw.get(id).into_iter().flatten() {
                flattener.push(update)?;
            }
            folded += 1;
            for dependent in self.dependents_of(id) {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if folded < self.raw.len() {
            let stuck = pending.keys().next().map(|id| (*id).clone()).unwrap_or_else(|| self.head.clone());
            return Err(ChainError::Cycle(stuck));
        }
        Ok(flattener.finish()?)
    }
}

impl std::fmt::Display for TxnChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chain({} components=[", self.head)?;
        for (i, id) in self.raw.keys().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "] tail={})", self.tail.len())
    }
}

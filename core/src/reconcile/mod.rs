//! The reconciliation round.
//!
//! A round takes the trusted candidate chains, bucketed by priority, and settles each one as accepted, rejected or
//! deferred:
//!
//! 1. per-round conflict bookkeeping starts empty
//! 2. chains touching a dirty key are deferred; chains that do not fit the current state, or that conflict with an
//!    unrelated update already applied this round, are rejected
//! 3. the remaining chains are compared pairwise to build a conflict graph
//! 4. buckets are processed from the highest priority down: a chain losing to a higher-priority accepted chain is
//!    rejected, one losing to a higher-priority deferred chain is deferred, and equal-priority rivals are both
//!    deferred
//! 5. accepted chains are applied to the state, skipping updates that an already-applied, provably later update
//!    supersedes
//! 6. deferred chains dirty the keys they touch, and conflicts among them are recorded with their options
//! 7. decisions are emitted for everything accepted or rejected
//!
//! Rounds are deterministic: the same candidates against the same state produce the same decisions and dirty marks.

mod conflicts;
mod status;
#[cfg(test)]
mod tests;

pub use conflicts::{Conflict, ConflictIndex, ConflictOption, ConflictSet};
pub use status::TxnStatus;

use std::collections::{BTreeMap, BTreeSet};

use orchestra_proto::{Decision, Initial, Key, PeerId, Recno, TxnPeerId, Update, UpdateDraft};
use tracing::{debug, info, warn};

use crate::{
    candidates::Candidates,
    chain::TxnChain,
    config::ReconcilerConfig,
    conflict::{classify, related},
    dirty::DirtyTracker,
    error::{ConflictError, ConsistencyError, ReconcileError, StorageError},
    storage::{stage_updates, StateStore},
};

/// Everything one round works from
#[derive(Debug)]
pub struct RoundInput {
    pub recno: Recno,
    pub candidates: Candidates,
    /// Updates already applied to the open round before any candidate is considered
    pub delta: Vec<Update>,
}

/// The result of one round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    pub recno: Recno,
    pub decisions: Vec<Decision>,
    /// Final status of every candidate chain, by head
    pub statuses: BTreeMap<TxnPeerId, TxnStatus>,
    /// Heads of the chains deferred this round
    pub deferred: BTreeSet<TxnPeerId>,
    pub conflicts: ConflictSet,
    /// Every update applied to the state this round, the initial delta included
    pub applied: Vec<Update>,
    /// Heads of chains that could not be processed, with the reason. They get no decision.
    pub faulted: BTreeMap<TxnPeerId, String>,
}

impl RoundOutcome {
    pub fn accepted(&self) -> BTreeSet<TxnPeerId> { self.decisions.iter().filter(|d| d.accepted).map(|d| d.tid.clone()).collect() }

    pub fn rejected(&self) -> BTreeSet<TxnPeerId> { self.decisions.iter().filter(|d| !d.accepted).map(|d| d.tid.clone()).collect() }
}

struct Entry {
    chain: TxnChain,
    priority: u32,
    status: TxnStatus,
    faulted: bool,
    applied: bool,
}

impl Entry {
    fn new(chain: TxnChain, priority: u32) -> Self { Self { chain, priority, status: TxnStatus::Unknown, faulted: false, applied: false } }

    fn live(&self) -> bool { !self.faulted }

    fn set(&mut self, next: TxnStatus) {
        match self.status.transition(next) {
            Some(status) => self.status = status,
            None => debug!("ignoring {} -> {} for {}", self.status, next, self.chain.head()),
        }
    }
}

/// Two updates on the same initial fact whose order cannot be established
struct Undetermined {
    key: Key,
    left: BTreeSet<TxnPeerId>,
    right: BTreeSet<TxnPeerId>,
}

/// The latest applied update per initial fact, and the entry that applied it
type Latest = BTreeMap<Initial, (Update, usize)>;

/// Runs rounds for one peer and keeps what later rounds and conflict resolution need: the dirty marks and the
/// outcome of every round.
pub struct Reconciler {
    peer: PeerId,
    config: ReconcilerConfig,
    dirty: DirtyTracker,
    history: BTreeMap<Recno, RoundOutcome>,
}

impl Reconciler {
    pub fn new(peer: PeerId, config: ReconcilerConfig) -> Self { Self { peer, config, dirty: DirtyTracker::new(), history: BTreeMap::new() } }

    pub fn config(&self) -> &ReconcilerConfig { &self.config }

    pub fn dirty(&self) -> &DirtyTracker { &self.dirty }

    pub fn outcome(&self, recno: Recno) -> Option<&RoundOutcome> { self.history.get(&recno) }

    pub fn conflicts(&self, recno: Recno) -> Option<&ConflictSet> { self.history.get(&recno).map(|o| &o.conflicts) }

    /// Earliest round in which any of `txns` was deferred
    pub fn first_deferral(&self, txns: &BTreeSet<TxnPeerId>) -> Option<Recno> {
        self.history.iter().find(|(_, outcome)| outcome.deferred.iter().any(|t| txns.contains(t))).map(|(recno, _)| *recno)
    }

    /// Forget everything derived from rounds after `recno`
    pub fn rewind_to(&mut self, recno: Recno) {
        self.history.retain(|r, _| *r <= recno);
        self.dirty.clear_from(recno + 1);
    }

    pub async fn run_round<S>(&mut self, state: &S, input: RoundInput) -> Result<RoundOutcome, ReconcileError>
    where S: StateStore + ?Sized {
        let RoundInput { recno, candidates, delta } = input;
        let Candidates { buckets, must_reject, mut faulted } = candidates;
        debug!("{} round {}: {} candidate chains, {} local updates", self.peer, recno, buckets.values().map(Vec::len).sum::<usize>(), delta.len());

        let mut entries: Vec<Entry> =
            buckets.into_iter().rev().flat_map(|(priority, chains)| chains.into_iter().map(move |chain| Entry::new(chain, priority))).collect();

        // step 2
        for entry in entries.iter_mut() {
            match self.screen(state, recno, &entry.chain, &delta).await {
                Ok(TxnStatus::Unknown) => {}
                Ok(status) => entry.set(status),
                Err(ReconcileError::Structural(err)) => {
                    warn!("{} round {}: {} faulted during screening: {}", self.peer, recno, entry.chain.head(), err);
                    entry.faulted = true;
                    faulted.insert(entry.chain.head().clone(), err.to_string());
                }
                Err(err) => return Err(err),
            }
        }

        // step 3
        let graph = conflict_graph(&mut entries, &mut faulted);

        // step 4
        prioritize(&mut entries, &graph);
        cascade(&mut entries);

        // step 5
        let mut applied = delta;
        let mut latest = Latest::new();
        let mut accepted = BTreeSet::new();
        for i in 0..entries.len() {
            if !entries[i].live() || !entries[i].status.is_accepted() {
                continue;
            }
            let (needed, record) = match needed_updates(&entries, i, &latest) {
                Ok(result) => result,
                Err(Undetermined { key, left, right }) if self.config.defer_on_undetermined_precedence => {
                    warn!("{} round {}: deferring {}, cannot order {:?} and {:?} on {}", self.peer, recno, entries[i].chain.head(), left, right, key);
                    entries[i].set(TxnStatus::DeferConflict);
                    cascade(&mut entries);
                    continue;
                }
                Err(Undetermined { key, left, right }) => return Err(ConsistencyError::UndeterminedPrecedence { key, left, right }.into()),
            };
            let needed: Vec<Update> = needed.into_iter().filter(|u| !applied.iter().any(|a: &Update| a.value_eq(u))).collect();
            state.apply(recno, &needed).await?;
            for (initial, update) in record {
                latest.insert(initial, (update, i));
            }
            applied.extend(needed);
            accepted.extend(entries[i].chain.components().cloned());
            entries[i].applied = true;
        }

        // step 6
        let (conflicts, faults) = self.record_deferrals(recno, &entries, &latest);
        for (i, reason) in faults {
            warn!("{} round {}: {} faulted while recording conflicts: {}", self.peer, recno, entries[i].chain.head(), reason);
            entries[i].faulted = true;
            faulted.insert(entries[i].chain.head().clone(), reason);
        }

        // step 7
        let mut rejected = must_reject;
        rejected.extend(entries.iter().filter(|e| e.live() && e.status.is_rejected()).map(|e| e.chain.head().clone()));
        rejected.retain(|id| !accepted.contains(id));
        let decisions: Vec<Decision> = accepted
            .iter()
            .map(|id| Decision::accept(id.clone(), recno))
            .chain(rejected.iter().map(|id| Decision::reject(id.clone(), recno)))
            .collect();

        let outcome = RoundOutcome {
            recno,
            decisions,
            statuses: entries.iter().filter(|e| e.live()).map(|e| (e.chain.head().clone(), e.status)).collect(),
            deferred: entries.iter().filter(|e| e.live() && e.status.is_deferred()).map(|e| e.chain.head().clone()).collect(),
            conflicts,
            applied,
            faulted,
        };
        info!(
            "{} round {}: {} accepted, {} rejected, {} deferred, {} conflicts",
            self.peer,
            recno,
            accepted.len(),
            rejected.len(),
            outcome.deferred.len(),
            outcome.conflicts.len()
        );
        self.history.insert(recno, outcome.clone());
        Ok(outcome)
    }

    /// Step 2 for a single chain. `Unknown` means the chain is still eligible.
    async fn screen<S>(&self, state: &S, recno: Recno, chain: &TxnChain, delta: &[Update]) -> Result<TxnStatus, ReconcileError>
    where S: StateStore + ?Sized {
        let contents = chain.contents();
        if let Some(key) = contents.iter().flat_map(Update::touched_keys).find(|key| self.dirty.is_dirty(key, recno)) {
            debug!("{} round {}: deferring {}, {} is dirty", self.peer, recno, chain.head(), key);
            return Ok(TxnStatus::Defer);
        }
        if !fits_state(state, recno, contents).await? {
            debug!("{} round {}: rejecting {}, it does not fit the current state", self.peer, recno, chain.head());
            return Ok(TxnStatus::Reject);
        }
        for update in contents {
            for done in delta.iter().filter(|d| d.relation() == update.relation() && !related(update, d)) {
                if let Some(kind) = classify(update, done)? {
                    debug!("{} round {}: rejecting {}, {} conflict with {}", self.peer, recno, chain.head(), kind, done);
                    return Ok(TxnStatus::Reject);
                }
            }
        }
        Ok(TxnStatus::Unknown)
    }

    /// Step 6: dirty the keys deferred chains still need, and record the conflicts among them. A pair whose
    /// comparison faults takes both chains out of the round, along with every conflict they take part in.
    fn record_deferrals(&mut self, recno: Recno, entries: &[Entry], latest: &Latest) -> (ConflictSet, BTreeMap<usize, String>) {
        let deferred: Vec<(usize, Vec<&Update>)> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.live() && e.status.is_deferred())
            .map(|(i, e)| (i, e.chain.contents().iter().filter(|u| !superseded(entries, latest, u)).collect()))
            .collect();

        for (_, needed) in &deferred {
            for key in needed.iter().flat_map(|u| u.touched_keys()) {
                self.dirty.mark(key, recno);
            }
        }

        let mut found = Vec::new();
        let mut faults = BTreeMap::new();
        for (n, (i, left)) in deferred.iter().enumerate() {
            for (j, right) in &deferred[n + 1..] {
                if overlapping(&entries[*i].chain, &entries[*j].chain) {
                    continue;
                }
                for u in left {
                    for v in right.iter().filter(|v| v.relation() == u.relation() && !tid_subset(u, v)) {
                        match classify(u, v) {
                            Ok(Some(kind)) => found.push((kind, (*u, *i), (*v, *j))),
                            Ok(None) => {}
                            Err(err) => {
                                faults.insert(*i, err.to_string());
                                faults.insert(*j, err.to_string());
                            }
                        }
                    }
                }
            }
        }

        let mut conflicts = ConflictSet::new();
        for (kind, left, right) in found.into_iter().filter(|(_, (_, i), (_, j))| !faults.contains_key(i) && !faults.contains_key(j)) {
            for (update, i) in [left, right] {
                if let Some(index) = ConflictIndex::of(kind, update) {
                    conflicts.register(index, update, entries[i].chain.head());
                }
            }
        }
        (conflicts, faults)
    }
}

/// Whether `updates` apply cleanly on top of the state of the open round
async fn fits_state<S>(state: &S, recno: Recno, updates: &[Update]) -> Result<bool, StorageError>
where S: StateStore + ?Sized {
    let mut snapshot = BTreeMap::new();
    for key in updates.iter().flat_map(Update::touched_keys) {
        if !snapshot.contains_key(&key) {
            let value = state.get_by_key(recno, &key).await?;
            snapshot.insert(key, value);
        }
    }
    match stage_updates(updates, |key| Ok(snapshot.get(key).cloned().flatten())) {
        Ok(_) => Ok(true),
        Err(StorageError::StateMismatch { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// One chain's components contain the other's: the same facts seen twice rather than a conflict
fn overlapping(a: &TxnChain, b: &TxnChain) -> bool {
    let (a, b) = (a.component_set(), b.component_set());
    a.is_subset(&b) || b.is_subset(&a)
}

fn tid_subset(u: &Update, v: &Update) -> bool { u.tids().is_subset(v.tids()) || v.tids().is_subset(u.tids()) }

fn chains_conflict(a: &TxnChain, b: &TxnChain) -> Result<bool, ConflictError> {
    for u in a.contents() {
        for v in b.contents().iter().filter(|v| v.relation() == u.relation() && !tid_subset(u, v)) {
            if classify(u, v)?.is_some() {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Step 3. A pair whose comparison faults takes both chains out of the round.
fn conflict_graph(entries: &mut [Entry], faulted: &mut BTreeMap<TxnPeerId, String>) -> BTreeMap<usize, BTreeSet<usize>> {
    let eligible: Vec<usize> = entries.iter().enumerate().filter(|(_, e)| e.live() && e.status == TxnStatus::Unknown).map(|(i, _)| i).collect();
    let mut graph: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    let mut faults = BTreeMap::new();

    for (n, &i) in eligible.iter().enumerate() {
        for &j in &eligible[n + 1..] {
            if overlapping(&entries[i].chain, &entries[j].chain) {
                continue;
            }
            match chains_conflict(&entries[i].chain, &entries[j].chain) {
                Ok(true) => {
                    graph.entry(i).or_default().insert(j);
                    graph.entry(j).or_default().insert(i);
                }
                Ok(false) => {}
                Err(err) => {
                    faults.insert(i, err.to_string());
                    faults.insert(j, err.to_string());
                }
            }
        }
    }

    for (i, reason) in faults {
        warn!("{} faulted during conflict detection: {}", entries[i].chain.head(), reason);
        entries[i].faulted = true;
        faulted.insert(entries[i].chain.head().clone(), reason);
    }
    graph
}

/// Step 4. Entries arrive ordered by descending priority.
fn prioritize(entries: &mut [Entry], graph: &BTreeMap<usize, BTreeSet<usize>>) {
    let eligible: Vec<usize> = entries.iter().enumerate().filter(|(_, e)| e.live() && e.status == TxnStatus::Unknown).map(|(i, _)| i).collect();
    let neighbors = |i: usize| graph.get(&i).into_iter().flatten().copied();

    let groups: Vec<Vec<usize>> = eligible.chunk_by(|a, b| entries[*a].priority == entries[*b].priority).map(<[usize]>::to_vec).collect();

    for group in &groups {
        let priority = entries[group[0]].priority;

        for &i in group {
            let higher: Vec<TxnStatus> = neighbors(i).filter(|n| entries[*n].live() && entries[*n].priority > priority).map(|n| entries[n].status).collect();
            if higher.contains(&TxnStatus::Accept) {
                entries[i].set(TxnStatus::RejectConflict);
            } else if higher.contains(&TxnStatus::DeferConflict) {
                entries[i].set(TxnStatus::DeferConflict);
            }
        }

        let contested: Vec<usize> = group
            .iter()
            .copied()
            .filter(|i| entries[*i].status == TxnStatus::Unknown)
            .filter(|i| neighbors(*i).any(|n| entries[n].live() && entries[n].priority == priority && entries[n].status == TxnStatus::Unknown))
            .collect();
        for i in contested {
            entries[i].set(TxnStatus::DeferConflict);
        }

        for &i in group {
            if entries[i].status == TxnStatus::Unknown {
                entries[i].set(TxnStatus::Accept);
            }
        }
    }
}

/// An accepted chain that contains the head of a rejected or deferred chain follows it down, until nothing changes.
/// Chains that were already applied are left alone.
fn cascade(entries: &mut [Entry]) {
    loop {
        let mut changed = false;
        for i in 0..entries.len() {
            if !entries[i].live() || entries[i].applied || !entries[i].status.is_accepted() {
                continue;
            }
            let blockers: Vec<TxnStatus> = entries
                .iter()
                .enumerate()
                .filter(|(j, e)| *j != i && e.live() && !e.status.is_accepted() && e.status != TxnStatus::Unknown)
                .filter(|(_, e)| entries[i].chain.contains(e.chain.head()))
                .map(|(_, e)| e.status)
                .collect();
            if blockers.iter().any(|s| s.is_rejected()) {
                entries[i].set(TxnStatus::RejectConflict);
                changed = true;
            } else if blockers.iter().any(|s| s.is_deferred()) {
                entries[i].set(TxnStatus::DeferConflict);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// Whether `later` provably comes after `earlier`: every transaction behind `earlier` is also behind `later`, or is
/// an ancestor of one of them
fn covers(later: &Update, later_chain: &TxnChain, earlier: &Update) -> bool {
    earlier.tids().iter().all(|t| later.tids().contains(t) || later.tids().iter().any(|l| later_chain.is_descendant_of(l, t)))
}

/// Whether an already-applied update makes `update` redundant
fn superseded(entries: &[Entry], latest: &Latest, update: &Update) -> bool {
    update.initial().and_then(|initial| latest.get(initial)).is_some_and(|(applied, j)| applied.value_eq(update) || covers(applied, &entries[*j].chain, update))
}

/// Rewrite `update` to start from the value `applied` left behind
fn rebase(applied: &Update, update: &Update) -> Option<Update> {
    let draft = UpdateDraft {
        old: applied.new_value().cloned(),
        new: update.new_value().cloned(),
        tids: update.tids().clone(),
        prev_tids: update.prev_tids().clone(),
        initial: update.initial().cloned(),
    };
    if draft.old == draft.new {
        return None;
    }
    draft.publish().ok()
}

/// Step 5 for entry `i`: the updates still to apply, and the updates that become the latest for their initial fact
fn needed_updates(entries: &[Entry], i: usize, latest: &Latest) -> Result<(Vec<Update>, Vec<(Initial, Update)>), Undetermined> {
    let chain = &entries[i].chain;
    let mut needed = Vec::new();
    let mut record = Vec::new();

    for update in chain.contents() {
        let Some(initial) = update.initial() else {
            if !update.is_placeholder() {
                needed.push(update.clone());
            }
            continue;
        };
        match latest.get(initial) {
            None => {
                if !update.is_placeholder() {
                    needed.push(update.clone());
                }
                record.push((initial.clone(), update.clone()));
            }
            Some((applied, _)) if applied.value_eq(update) => {}
            Some((applied, _)) if covers(update, chain, applied) => {
                needed.extend(rebase(applied, update));
                record.push((initial.clone(), update.clone()));
            }
            Some((applied, j)) if covers(applied, &entries[*j].chain, update) => {}
            Some((applied, _)) => {
                return Err(Undetermined { key: update.subject_key(), left: applied.tids().clone(), right: update.tids().clone() });
            }
        }
    }
    Ok((needed, record))
}

//! Rerunning recorded rounds.
//!
//! Live rounds, conflict resolution and replay-on-reconnect all drive the same procedure: rebuild the round's
//! inputs from the log as they were when the round first ran, then run the round.

use std::collections::{BTreeMap, BTreeSet};

use orchestra_proto::{Recno, TxnPeerId, Update};
use tracing::{debug, info, warn};

use crate::{
    candidates::trusted_candidates,
    config::ReconcilerConfig,
    error::{ConsistencyError, ReconcileError},
    reconcile::{Reconciler, RoundInput, RoundOutcome},
    storage::{memory::MemoryStateStore, DecisionTable, RoundRecord, StateStore, UpdateLog},
};

/// Chosen option per conflict id per round. `None` rejects every option of that conflict.
pub type Resolutions = BTreeMap<Recno, BTreeMap<usize, Option<usize>>>;

/// Whether the peer's own transactions of a round are already in the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalDelta {
    /// Applied as they were published, which is the case for the open round
    Applied,
    /// Rewound away, so they are applied again before the round runs
    Reapply,
}

/// Run the round described by `record`, under the trust conditions it records. The state must be positioned at
/// `record.recno - 1`.
pub async fn rerun_round<L, S>(log: &L, state: &S, reconciler: &mut Reconciler, record: &RoundRecord, local: LocalDelta) -> Result<RoundOutcome, ReconcileError>
where
    L: UpdateLog + ?Sized,
    S: StateStore + ?Sized,
{
    let recno = record.recno;
    let delta: Vec<Update> = log.local_transactions_at(recno).await?.into_iter().flat_map(|txn| txn.updates).collect();
    if local == LocalDelta::Reapply && !delta.is_empty() {
        state.apply(recno, &delta).await?;
    }

    let mut oracle = DecisionTable::from_decisions(log.peer().clone(), &log.decisions_through(recno - 1).await?);
    for id in &record.forced {
        oracle.force_reject(id.clone());
    }

    let mut candidates = trusted_candidates(log, record.horizon, &oracle, &record.trust).await?;
    candidates.must_reject.extend(record.forced.iter().cloned());

    reconciler.run_round(state, RoundInput { recno, candidates, delta }).await
}

/// Make a finished round durable: decisions first, then the round record, then the state
pub async fn commit_round<L, S>(log: &L, state: &S, record: RoundRecord, outcome: &RoundOutcome) -> Result<(), ReconcileError>
where
    L: UpdateLog + ?Sized,
    S: StateStore + ?Sized,
{
    log.record_decisions(record.recno, &outcome.decisions).await?;
    log.finish_round(record).await?;
    state.advance_round().await?;
    Ok(())
}

/// The transactions that resolving conflicts rejects, keyed by the round in which each one was first deferred
pub fn forced_rejections(reconciler: &Reconciler, resolutions: &Resolutions) -> Result<BTreeMap<Recno, BTreeSet<TxnPeerId>>, ConsistencyError> {
    let mut forced: BTreeMap<Recno, BTreeSet<TxnPeerId>> = BTreeMap::new();

    for (&recno, choices) in resolutions {
        let conflicts = reconciler.conflicts(recno).ok_or(ConsistencyError::UnknownRound(recno))?;
        for (&id, &choice) in choices {
            let conflict = conflicts.get(id).ok_or(ConsistencyError::UnknownConflict { recno, conflict: id })?;
            let kept = match choice {
                Some(option) => conflict.option(option).ok_or(ConsistencyError::UnknownOption { recno, conflict: id, option })?.txns.clone(),
                None => BTreeSet::new(),
            };
            for txn in conflict.txns().into_iter().filter(|t| !kept.contains(t)) {
                let round = reconciler.first_deferral(&BTreeSet::from([txn.clone()])).unwrap_or(recno);
                forced.entry(round).or_default().insert(txn);
            }
        }
    }
    Ok(forced)
}

/// Rerun every recorded round from scratch against a private state, with a fresh reconciler. Each round is judged by
/// the trust conditions it was recorded with.
///
/// With `verify_replay` set, each round's recomputed accept set must equal the recorded one. Returns the rebuilt
/// reconciler together with the outcome of every round.
pub async fn replay_log<L>(log: &L, config: ReconcilerConfig) -> Result<(Reconciler, Vec<RoundOutcome>), ReconcileError>
where L: UpdateLog + ?Sized {
    let last = log.current_round().await?;
    let verify = config.verify_replay;
    let scratch = MemoryStateStore::new();
    let mut reconciler = Reconciler::new(log.peer().clone(), config);
    let mut outcomes = Vec::new();

    info!("{} replaying {} rounds", log.peer(), last);
    for recno in 1..=last {
        let record = log.round_record(recno).await?.ok_or(ConsistencyError::UnknownRound(recno))?;
        let outcome = rerun_round(log, &scratch, &mut reconciler, &record, LocalDelta::Reapply).await?;

        let recorded: BTreeSet<TxnPeerId> = log.decisions_at(recno).await?.into_iter().filter(|d| d.accepted).map(|d| d.tid).collect();
        let recomputed = outcome.accepted();
        if recorded != recomputed {
            if verify {
                return Err(ConsistencyError::ReplayDiverged { recno, recorded, recomputed }.into());
            }
            warn!("{} replay of round {} diverged: recorded {:?}, recomputed {:?}", log.peer(), recno, recorded, recomputed);
        } else {
            debug!("{} replayed round {}: {} accepted", log.peer(), recno, recomputed.len());
        }

        scratch.advance_round().await?;
        outcomes.push(outcome);
    }
    Ok((reconciler, outcomes))
}

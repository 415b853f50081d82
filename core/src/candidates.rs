use std::collections::{BTreeMap, BTreeSet};

use orchestra_proto::TxnPeerId;
use tracing::{debug, warn};

use crate::{
    chain::TxnChain,
    error::{ChainError, StorageError},
    storage::{DecisionOracle, DecisionState, HorizonSource, UpdateLog},
    trust::TrustConditions,
};

/// Trusted transaction chains for one round, bucketed by priority
#[derive(Debug, Default)]
pub struct Candidates {
    pub buckets: BTreeMap<u32, Vec<TxnChain>>,
    /// Heads depending on a rejected transaction
    pub must_reject: BTreeSet<TxnPeerId>,
    /// Heads whose chain could not be built, with the reason
    pub faulted: BTreeMap<TxnPeerId, String>,
}

impl Candidates {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, priority: u32, chain: TxnChain) { self.buckets.entry(priority).or_default().push(chain); }

    pub fn len(&self) -> usize { self.buckets.values().map(Vec::len).sum() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Priority of a whole chain: the highest component priority, or 0 when any component is untrusted
pub fn chain_priority(chain: &TxnChain, trust: &TrustConditions) -> u32 {
    let mut priority = 0;
    for (id, updates) in chain.raw_txns() {
        match trust.transaction_priority(&id.peer, updates) {
            0 => return 0,
            p => priority = priority.max(p),
        }
    }
    priority
}

/// Build a chain for every visible, undecided transaction and bucket the trusted ones.
pub async fn trusted_candidates<L>(log: &L, horizon: u64, oracle: &dyn DecisionOracle, trust: &TrustConditions) -> Result<Candidates, StorageError>
where L: UpdateLog + ?Sized {
    let source = HorizonSource::new(log, horizon);
    let mut candidates = Candidates::new();

    for id in log.published_through(horizon).await? {
        if oracle.decision(&id) != DecisionState::Undecided {
            continue;
        }
        match TxnChain::build(id.clone(), &source, oracle).await {
            Ok(chain) => match chain_priority(&chain, trust) {
                0 => debug!("{} ignoring untrusted {}", log.peer(), chain),
                priority => candidates.push(priority, chain),
            },
            Err(ChainError::RejectedAntecedent { head, antecedent }) => {
                debug!("{} must reject {}: antecedent {} was rejected", log.peer(), head, antecedent);
                candidates.must_reject.insert(head);
            }
            Err(ChainError::Storage(err)) => return Err(err),
            Err(err) => {
                warn!("{} cannot build chain for {}: {}", log.peer(), id, err);
                candidates.faulted.insert(id, err.to_string());
            }
        }
    }
    Ok(candidates)
}

use serde::{Deserialize, Serialize};

/// Where a transaction chain stands within one round.
///
/// `Reject` and `Defer` are final for the round. `Accept` can still be downgraded to one of the conflict statuses,
/// and `DeferConflict` to `RejectConflict`, but nothing is ever upgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    Unknown,
    Accept,
    Defer,
    Reject,
    RejectConflict,
    DeferConflict,
}

impl TxnStatus {
    pub fn is_accepted(self) -> bool { self == TxnStatus::Accept }

    pub fn is_deferred(self) -> bool { matches!(self, TxnStatus::Defer | TxnStatus::DeferConflict) }

    pub fn is_rejected(self) -> bool { matches!(self, TxnStatus::Reject | TxnStatus::RejectConflict) }

    pub fn is_final(self) -> bool { matches!(self, TxnStatus::Reject | TxnStatus::Defer) }

    fn rank(self) -> u8 {
        match self {
            TxnStatus::Unknown => 4,
            TxnStatus::Accept => 3,
            TxnStatus::Defer | TxnStatus::DeferConflict => 2,
            TxnStatus::Reject | TxnStatus::RejectConflict => 1,
        }
    }

    /// The status after moving to `next`, or `None` if that move is not allowed
    pub fn transition(self, next: TxnStatus) -> Option<TxnStatus> {
        if self.is_final() || next == TxnStatus::Unknown || next.rank() > self.rank() {
            return None;
        }
        if self != TxnStatus::Unknown && !matches!(next, TxnStatus::RejectConflict | TxnStatus::DeferConflict) {
            return None;
        }
        Some(next)
    }
}

impl std::fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TxnStatus::Unknown => "UNKNOWN",
            TxnStatus::Accept => "ACCEPT",
            TxnStatus::Defer => "DEFER",
            TxnStatus::Reject => "REJECT",
            TxnStatus::RejectConflict => "REJECTCONFLICT",
            TxnStatus::DeferConflict => "DEFERCONFLICT",
        };
        f.write_str(name)
    }
}

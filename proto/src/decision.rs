use serde::{Deserialize, Serialize};

use crate::id::{Recno, TxnPeerId};

/// The outcome of reconciling one transaction. Append-only: once recorded it is only ever revised by
/// conflict-resolution replay, which rewinds and recomputes a suffix of rounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Decision {
    pub tid: TxnPeerId,
    pub recno: Recno,
    pub accepted: bool,
}

impl Decision {
    pub fn accept(tid: TxnPeerId, recno: Recno) -> Self { Self { tid, recno, accepted: true } }

    pub fn reject(tid: TxnPeerId, recno: Recno) -> Self { Self { tid, recno, accepted: false } }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} @{}", if self.accepted { "accept" } else { "reject" }, self.tid, self.recno)
    }
}

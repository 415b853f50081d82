use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DecodeError;

/// Reconciliation round number. Round 0 is the empty initial state; the first reconciliation is round 1.
pub type Recno = u32;

/// Identity of a participating peer
#[derive(PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self { PeerId(name.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "P{}", self.0) }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self { PeerId(name.to_owned()) }
}

impl From<String> for PeerId {
    fn from(name: String) -> Self { PeerId(name) }
}

/// Global identity of a published transaction: the originating peer plus its local transaction number.
///
/// There is no meaningful total order on transactions; `Ord` exists only so that sets and maps of ids
/// iterate deterministically, which round replay depends on.
#[derive(PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TxnPeerId {
    pub tid: u32,
    pub peer: PeerId,
}

impl TxnPeerId {
    pub fn new(tid: u32, peer: impl Into<PeerId>) -> Self { Self { tid, peer: peer.into() } }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.peer.0.len());
        bytes.extend_from_slice(&self.tid.to_be_bytes());
        bytes.extend_from_slice(self.peer.0.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 4 {
            return Err(DecodeError::InvalidLength);
        }
        let (tid, peer) = bytes.split_at(4);
        let tid = u32::from_be_bytes([tid[0], tid[1], tid[2], tid[3]]);
        let peer = String::from_utf8(peer.to_vec()).map_err(|_| DecodeError::InvalidFormat)?;
        Ok(Self { tid, peer: PeerId(peer) })
    }

    pub fn to_base64(&self) -> String { general_purpose::URL_SAFE_NO_PAD.encode(self.to_bytes()) }

    pub fn from_base64<T: AsRef<[u8]>>(input: T) -> Result<Self, DecodeError> {
        let decoded = general_purpose::URL_SAFE_NO_PAD.decode(input).map_err(DecodeError::InvalidBase64)?;
        Self::from_bytes(&decoded)
    }
}

impl fmt::Debug for TxnPeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.peer, self.tid) }
}

impl fmt::Display for TxnPeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.peer, self.tid) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_base64() {
        let id = TxnPeerId::new(42, "alice");
        let encoded = id.to_base64();
        assert_eq!(TxnPeerId::from_base64(&encoded).unwrap(), id);
        assert_eq!(format!("{id}"), "alice:42");
    }

    #[test]
    fn test_txn_id_short_bytes() {
        assert!(matches!(TxnPeerId::from_bytes(&[0, 1]), Err(DecodeError::InvalidLength)));
    }
}

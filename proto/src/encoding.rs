//! Tiered byte encoding for updates and transactions.
//!
//! Downstream stores pick the cheapest tier sufficient for their use:
//! - [`Fidelity::Values`]: old/new values only (wire transfer of state)
//! - [`Fidelity::WithTids`]: adds component and antecedent transaction ids (durable update log)
//! - [`Fidelity::Full`]: adds the initial value/id and the insert/delete pairing hint (full snapshot dump)
//!
//! Placeholders carry no old or new value and can only be represented at `Full`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{
    error::DecodeError,
    id::TxnPeerId,
    transaction::Transaction,
    tuple::Tuple,
    update::{Initial, Update, UpdateDraft},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Fidelity {
    Values = 0,
    WithTids = 1,
    Full = 2,
}

impl Fidelity {
    fn tag(self) -> u8 { self as u8 }
}

#[derive(Serialize, Deserialize)]
struct ValuesTier {
    old: Option<Tuple>,
    new: Option<Tuple>,
}

#[derive(Serialize, Deserialize)]
struct TidsTier {
    old: Option<Tuple>,
    new: Option<Tuple>,
    tids: BTreeSet<TxnPeerId>,
    prev_tids: BTreeSet<TxnPeerId>,
}

#[derive(Serialize, Deserialize)]
struct FullTier {
    old: Option<Tuple>,
    new: Option<Tuple>,
    tids: BTreeSet<TxnPeerId>,
    prev_tids: BTreeSet<TxnPeerId>,
    initial: Option<Initial>,
    /// set when the update is an insertion later deleted in the same history
    inserted_then_deleted: bool,
}

fn write_tier<T: Serialize>(fidelity: Fidelity, body: &T) -> Result<Vec<u8>, bincode::Error> {
    let mut bytes = vec![fidelity.tag()];
    bincode::serialize_into(&mut bytes, body)?;
    Ok(bytes)
}

fn read_tier(bytes: &[u8], fidelity: Fidelity) -> Result<&[u8], DecodeError> {
    let (tag, body) = bytes.split_first().ok_or(DecodeError::InvalidLength)?;
    if *tag != fidelity.tag() {
        return Err(DecodeError::FidelityMismatch { expected: fidelity.tag(), found: *tag });
    }
    Ok(body)
}

fn publish(draft: UpdateDraft) -> Result<Update, DecodeError> { draft.publish().map_err(|e| DecodeError::Other(e.into())) }

impl Update {
    pub fn encode(&self, fidelity: Fidelity) -> Result<Vec<u8>, bincode::Error> {
        let old = self.old().cloned();
        let new = self.new_value().cloned();
        match fidelity {
            Fidelity::Values => write_tier(fidelity, &ValuesTier { old, new }),
            Fidelity::WithTids => {
                write_tier(fidelity, &TidsTier { old, new, tids: self.tids().clone(), prev_tids: self.prev_tids().clone() })
            }
            Fidelity::Full => write_tier(
                fidelity,
                &FullTier {
                    old,
                    new,
                    tids: self.tids().clone(),
                    prev_tids: self.prev_tids().clone(),
                    initial: self.initial().cloned(),
                    inserted_then_deleted: self.is_placeholder(),
                },
            ),
        }
    }

    pub fn decode(bytes: &[u8], fidelity: Fidelity) -> Result<Self, DecodeError> {
        let body = read_tier(bytes, fidelity)?;
        match fidelity {
            Fidelity::Values => {
                let tier: ValuesTier = bincode::deserialize(body)?;
                publish(UpdateDraft { old: tier.old, new: tier.new, ..Default::default() })
            }
            Fidelity::WithTids => {
                let tier: TidsTier = bincode::deserialize(body)?;
                publish(UpdateDraft { old: tier.old, new: tier.new, tids: tier.tids, prev_tids: tier.prev_tids, initial: None })
            }
            Fidelity::Full => {
                let tier: FullTier = bincode::deserialize(body)?;
                let has_value = tier.old.is_some() || tier.new.is_some();
                if tier.inserted_then_deleted == has_value {
                    return Err(DecodeError::InvalidFormat);
                }
                publish(UpdateDraft { old: tier.old, new: tier.new, tids: tier.tids, prev_tids: tier.prev_tids, initial: tier.initial })
            }
        }
    }
}

impl Transaction {
    pub fn encode(&self, fidelity: Fidelity) -> Result<Vec<u8>, bincode::Error> {
        let updates = self.updates.iter().map(|u| u.encode(fidelity)).collect::<Result<Vec<_>, _>>()?;
        bincode::serialize(&(fidelity.tag(), &self.id, updates))
    }

    pub fn decode(bytes: &[u8], fidelity: Fidelity) -> Result<Self, DecodeError> {
        let (tag, id, updates): (u8, TxnPeerId, Vec<Vec<u8>>) = bincode::deserialize(bytes)?;
        if tag != fidelity.tag() {
            return Err(DecodeError::FidelityMismatch { expected: fidelity.tag(), found: tag });
        }
        let updates = updates.iter().map(|bytes| Update::decode(bytes, fidelity)).collect::<Result<Vec<_>, _>>()?;
        Ok(Transaction { id, updates })
    }
}

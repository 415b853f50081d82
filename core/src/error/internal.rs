//! Internal error types.
//!
//! These describe faults inside a single component. They are folded into [`super::ReconcileError`] at the
//! peer boundary.

use std::collections::BTreeSet;

use orchestra_proto::{DecodeError, Key, Recno, RelationId, Tuple, TxnPeerId, UpdateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transaction not found: {0}")]
    TransactionNotFound(TxnPeerId),

    #[error("transaction already published: {0}")]
    DuplicateTransaction(TxnPeerId),

    #[error("state mismatch at {key}: expected {expected:?}, found {found:?}")]
    StateMismatch { key: Key, expected: Option<Tuple>, found: Option<Tuple> },

    #[error("round {requested} is not writable (current round {current})")]
    RoundUnavailable { requested: Recno, current: Recno },

    #[error("round {found} recorded out of order (expected {expected})")]
    OutOfOrderRound { expected: Recno, found: Recno },

    #[error("decode error: {0}")]
    DecodeError(DecodeError),

    #[error("serialization error: {0}")]
    SerializationError(Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("backend error: {0}")]
    BackendError(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<DecodeError> for StorageError {
    fn from(err: DecodeError) -> Self { StorageError::DecodeError(err) }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self { StorageError::SerializationError(err) }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self { StorageError::BackendError(Box::new(err)) }
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(err: std::sync::PoisonError<T>) -> Self { StorageError::BackendError(err.to_string().into()) }
}

/// Trust rules are validated when they are configured, never during a round
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("priority {priority} outside 1..={max}")]
    PriorityOutOfRange { priority: u32, max: u32 },

    #[error("unknown relation: {0}")]
    UnknownRelation(RelationId),

    #[error("trust condition encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConflictError {
    #[error("cannot compare updates of different relations ({left} vs {right})")]
    DifferentRelations { left: RelationId, right: RelationId },

    #[error("insertion and deletion of the same key {0}")]
    InsertDeleteSameKey(Key),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlattenError {
    #[error("updates to {key} do not chain: expected {expected:?}, found {found:?}")]
    Inconsistent { key: Key, expected: Option<Tuple>, found: Option<Tuple> },

    #[error("{0} modified after it was deleted")]
    ModifiedAfterDelete(Key),

    #[error("{0} inserted over an existing value")]
    InsertOverExisting(Key),

    #[error("two updates claim key {0}")]
    KeyCollision(Key),

    #[error("invalid update: {0}")]
    Update(#[from] UpdateError),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("head transaction {0} is not available")]
    MissingHead(TxnPeerId),

    /// Expected and recoverable: the head must be treated as rejected
    #[error("{head} depends on rejected transaction {antecedent}")]
    RejectedAntecedent { head: TxnPeerId, antecedent: TxnPeerId },

    #[error("dependency cycle through {0}")]
    Cycle(TxnPeerId),

    #[error("flatten: {0}")]
    Flatten(#[from] FlattenError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("log is at round {log} but state is at round {state}")]
    RoundMismatch { log: Recno, state: Recno },

    #[error("replay of round {recno} diverged: recorded {recorded:?}, recomputed {recomputed:?}")]
    ReplayDiverged { recno: Recno, recorded: BTreeSet<TxnPeerId>, recomputed: BTreeSet<TxnPeerId> },

    #[error("cannot order updates {left:?} and {right:?} on {key}")]
    UndeterminedPrecedence { key: Key, left: BTreeSet<TxnPeerId>, right: BTreeSet<TxnPeerId> },

    #[error("round {0} has no record")]
    UnknownRound(Recno),

    #[error("round {recno} has no conflict {conflict}")]
    UnknownConflict { recno: Recno, conflict: usize },

    #[error("conflict {conflict} of round {recno} has no option {option}")]
    UnknownOption { recno: Recno, conflict: usize, option: usize },
}

//! Public error types.
//!
//! Every peer operation returns [`ReconcileError`]. Its variants follow the fault taxonomy: consistency
//! faults are fatal for the operation, trust faults are raised at configuration time, structural faults
//! point at corrupted updates, and storage faults come from the backends.

pub mod internal;

pub use internal::{ChainError, ConflictError, ConsistencyError, FlattenError, StorageError, TrustError};

use orchestra_proto::UpdateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("consistency fault: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("trust configuration: {0}")]
    Trust(#[from] TrustError),

    #[error("structural fault: {0}")]
    Structural(#[from] StructuralError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// An update or update pair violating an invariant of the data model
#[derive(Debug, Error)]
pub enum StructuralError {
    #[error("{0}")]
    Conflict(#[from] ConflictError),

    #[error("{0}")]
    Flatten(#[from] FlattenError),

    #[error("{0}")]
    Update(#[from] UpdateError),

    /// A chain that cannot be built: missing head, cycle, or rejected antecedent
    #[error("{0}")]
    Chain(ChainError),
}

impl From<ConflictError> for ReconcileError {
    fn from(err: ConflictError) -> Self { ReconcileError::Structural(err.into()) }
}

impl From<FlattenError> for ReconcileError {
    fn from(err: FlattenError) -> Self { ReconcileError::Structural(err.into()) }
}

impl From<UpdateError> for ReconcileError {
    fn from(err: UpdateError) -> Self { ReconcileError::Structural(err.into()) }
}

impl From<ChainError> for ReconcileError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Flatten(e) => e.into(),
            ChainError::Storage(e) => e.into(),
            other => ReconcileError::Structural(StructuralError::Chain(other)),
        }
    }
}

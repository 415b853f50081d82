//! Trust-based reconciliation of replicated relational data.
//!
//! A [`Peer`] publishes local edits as transactions and periodically reconciles: every trusted remote transaction
//! it has not decided yet is accepted, rejected or deferred, deterministically, so that the same rounds can be rerun
//! from the log after a restart or after conflicts have been resolved.

pub mod candidates;
pub mod chain;
pub mod config;
pub mod conflict;
pub mod dirty;
pub mod error;
pub mod flatten;
pub mod peer;
pub mod reconcile;
pub mod replay;
pub mod storage;
pub mod trust;

pub use config::ReconcilerConfig;
pub use error::ReconcileError;
pub use peer::{Change, Peer};
pub use reconcile::{Conflict, ConflictSet, RoundOutcome, TxnStatus};
pub use replay::Resolutions;
pub use trust::{TrustConditions, TuplePredicate};

pub use orchestra_proto as proto;

#[cfg(test)]
#[ctor::ctor]
fn init_tracing() { tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).with_test_writer().init(); }

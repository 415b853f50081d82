//! Sled backends for the Orchestra update log and snapshot store.
//!
//! One database holds the shared publications, every peer's decisions and round records, and every peer's
//! versioned replica.

mod error;
mod state;
mod store;

pub use error::SledStorageError;
pub use state::SledStateStore;
pub use store::{SledLog, SledUpdateStore};

#[cfg(test)]
#[ctor::ctor]
fn init_tracing() { tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).with_test_writer().init(); }

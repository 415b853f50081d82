use orchestra_core::error::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SledStorageError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("malformed key in {tree}: {len} bytes")]
    MalformedKey { tree: &'static str, len: usize },

    #[error("sled transaction aborted: {0}")]
    Aborted(String),
}

impl From<SledStorageError> for StorageError {
    fn from(err: SledStorageError) -> Self {
        match err {
            SledStorageError::Bincode(e) => StorageError::SerializationError(e),
            other => StorageError::BackendError(Box::new(other)),
        }
    }
}

pub fn sled_error(err: sled::Error) -> StorageError { SledStorageError::Sled(err).into() }

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("conversation not found: {id}")]
    NotFound { id: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

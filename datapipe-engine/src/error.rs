use thiserror::Error;

use datapipe_core::{EnqueueError, TaskFailed};
use datapipe_storage::StorageError;

use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Failed(#[from] TaskFailed),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("result cache: {0}")]
    Cache(String),

    #[error("cannot materialize arguments: {0}")]
    Materialize(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

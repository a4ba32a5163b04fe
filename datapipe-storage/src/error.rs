use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue store unavailable: {0}")]
    Unavailable(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

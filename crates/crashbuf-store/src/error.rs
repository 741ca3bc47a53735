use thiserror::Error;

/// Result type local to crashbuf-store.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend never initialized or permanently gone. Callers degrade to no-op.
    #[error("buffer store unavailable: {0}")]
    Unavailable(String),

    /// A single append/delete failed (e.g. disk full). Only that write is lost.
    #[error("buffer store write failed: {0}")]
    Write(String),

    #[error("buffer store read failed: {0}")]
    Read(String),

    /// One stored entry failed its checksum or could not be decoded.
    #[error("corrupt store entry: {0}")]
    Corrupt(String),

    #[error("store configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<crashbuf_core::Error> for StoreError {
    fn from(e: crashbuf_core::Error) -> Self {
        StoreError::Config(e.to_string())
    }
}

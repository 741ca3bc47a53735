use thiserror::Error;

use crashbuf_store::StoreError;

pub type BufferResult<T> = std::result::Result<T, BufferError>;

/// Construction-time failures. Once a `CrashBuffer` exists, store problems are
/// absorbed by the guarded store and never returned to callers.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer configuration: {0}")]
    Config(String),

    #[error("no tokio runtime: {0}")]
    Runtime(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<crashbuf_core::Error> for BufferError {
    fn from(e: crashbuf_core::Error) -> Self {
        BufferError::Config(e.to_string())
    }
}

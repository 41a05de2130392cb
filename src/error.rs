#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("engine not initialized (call initialize first)")]
    NotInitialized,

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("text must not be empty")]
    EmptyText,

    #[error("validation error: {0}")]
    InvalidInput(String),

    #[error("could not acquire {0} lock within timeout")]
    LockTimeout(&'static str),

    #[error("encoder backend error: {0}")]
    Encoder(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// Whether retrying could help. Only encoder/generator calls are
    /// retryable; store and validation failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Encoder(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("thread not found: {0}")]
    NotFound(String),

    #[error("invalid thread id: {0:?}")]
    InvalidId(String),

    #[error("{0}")]
    Other(String),
}

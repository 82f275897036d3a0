use relay_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid input line: {0}")]
    InvalidLine(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl NodeError {
    /// Problems with one input line; the node logs them and keeps going.
    pub fn is_recoverable(&self) -> bool {
        match self {
            NodeError::InvalidLine(_) => true,
            NodeError::Store(e) => !e.is_fatal(),
            NodeError::Io(_) | NodeError::Worker(_) => false,
        }
    }
}

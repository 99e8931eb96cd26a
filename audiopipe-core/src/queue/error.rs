use std::path::PathBuf;

use thiserror::Error;

use crate::sqlite::is_unavailable;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open job queue {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("job queue statement failed: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("job payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("job queue path not configured")]
    MissingStore,
    #[error("invalid queue name: {0}")]
    InvalidQueue(String),
    #[error("lease on job {job_id} is no longer held")]
    LeaseLost { job_id: i64 },
    #[error("job queue unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("background queue operation failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl QueueError {
    pub fn is_unavailable(&self) -> bool {
        match self {
            QueueError::Open { .. } | QueueError::ServiceUnavailable(_) => true,
            QueueError::Database(err) => is_unavailable(err),
            _ => false,
        }
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

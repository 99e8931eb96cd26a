use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::capability::CapabilityError;
use crate::lifecycle::LifecycleError;
use crate::queue::{QueueError, StageQueue};
use crate::task::TaskError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Store(#[from] TaskError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{stage} stage timed out after {}s", .after.as_secs())]
    Timeout { stage: StageQueue, after: Duration },
    #[error("job {job_id} on the {queue} queue carries a {found} payload")]
    UnexpectedPayload {
        job_id: i64,
        queue: StageQueue,
        found: StageQueue,
    },
}

impl WorkerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WorkerError::Io {
            path: path.into(),
            source,
        }
    }

    /// No amount of redelivery will make the job succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkerError::Capability(err) => err.is_fatal(),
            WorkerError::UnexpectedPayload { .. } => true,
            WorkerError::Store(TaskError::InvalidTransition { .. })
            | WorkerError::Store(TaskError::InvalidPatch { .. }) => true,
            _ => false,
        }
    }
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

use std::path::PathBuf;

use thiserror::Error;

use super::models::TaskStage;
use crate::sqlite::is_unavailable;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task {task_id} not found")]
    NotFound { task_id: String },
    #[error("task {task_id} is in stage {actual}")]
    StageConflict { task_id: String, actual: TaskStage },
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStage,
        to: TaskStage,
    },
    #[error("invalid update for task {task_id}: {reason}")]
    InvalidPatch { task_id: String, reason: String },
    #[error("task {task_id} has expired")]
    Expired { task_id: String },
    #[error("task store path not configured")]
    MissingStore,
    #[error("could not allocate a unique task id")]
    IdExhausted,
    #[error("background store operation failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TaskError {
    /// Store could not be reached; the caller may retry later.
    pub fn is_unavailable(&self) -> bool {
        match self {
            TaskError::Unavailable { .. } => true,
            TaskError::Database(err) => is_unavailable(err),
            _ => false,
        }
    }
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

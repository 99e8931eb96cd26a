//! Stage workers. Each stage has a handler that owns the per-job logic and a
//! runner that claims jobs, enforces the stage timeout and settles the job
//! with the queue.

pub mod cleanup;
pub mod error;
pub mod fetch;
pub mod progress;
pub mod retry;
pub mod runner;
pub mod transcode;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::PipelineConfig;
use crate::queue::{Job, StageQueue};
use crate::task::{SqliteTaskStore, TaskError, TaskPatch, TaskStage};

pub use cleanup::CleanupHandler;
pub use error::{WorkerError, WorkerResult};
pub use fetch::FetchHandler;
pub use progress::TaskProgress;
pub use retry::RetryPolicy;
pub use runner::{StageRunner, WorkerPool};
pub use transcode::TranscodeHandler;

pub const CANCELLED_REASON: &str = "cancelled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran and handed the task on.
    Completed,
    /// Nothing to do, usually a redelivered job for a task that moved on.
    Skipped(String),
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> StageQueue;

    async fn handle(&self, job: &Job) -> WorkerResult<StageOutcome>;

    /// Runs once the job will not be retried: records the failure on the task
    /// and releases whatever the stage produced.
    async fn fail(&self, job: &Job, reason: &str) -> WorkerResult<()>;
}

/// Filesystem layout for intermediate and final artifacts, keyed by task id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub temp_dir: PathBuf,
    pub storage_dir: PathBuf,
}

impl ArtifactPaths {
    pub fn new(temp_dir: impl Into<PathBuf>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            storage_dir: storage_dir.into(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.paths.temp_dir, &config.paths.storage_dir)
    }

    pub fn work_dir(&self, task_id: &str) -> PathBuf {
        self.temp_dir.join(task_id)
    }

    pub fn output(&self, task_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{task_id}.mp3"))
    }

    pub fn partial_output(&self, task_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{task_id}.mp3.part"))
    }

    pub fn is_temp(&self, path: &Path) -> bool {
        path.starts_with(&self.temp_dir) && !path.starts_with(&self.storage_dir)
    }

    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        tokio::fs::create_dir_all(&self.storage_dir).await
    }
}

const OPEN_STAGES: [TaskStage; 3] = [TaskStage::Pending, TaskStage::Fetching, TaskStage::Transcoding];

/// Moves a still-open task to FAILED. A task that already reached a
/// terminal stage is left alone and its stage returned.
pub(crate) async fn mark_failed(
    store: &SqliteTaskStore,
    task_id: &str,
    reason: &str,
) -> WorkerResult<Option<TaskStage>> {
    match store
        .transition_async(task_id, &OPEN_STAGES, &TaskPatch::failed(reason))
        .await
    {
        Ok(_) => Ok(None),
        Err(TaskError::StageConflict { actual, .. }) => Ok(Some(actual)),
        Err(TaskError::NotFound { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn unexpected_payload(job: &Job, expected: StageQueue) -> WorkerError {
    WorkerError::UnexpectedPayload {
        job_id: job.id,
        queue: expected,
        found: job.payload.queue(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_keyed_by_task() {
        let paths = ArtifactPaths::new("/tmp/ap", "/tmp/ap/output");
        assert_eq!(paths.work_dir("task-1"), PathBuf::from("/tmp/ap/task-1"));
        assert_eq!(paths.output("task-1"), PathBuf::from("/tmp/ap/output/task-1.mp3"));
        assert_eq!(
            paths.partial_output("task-1"),
            PathBuf::from("/tmp/ap/output/task-1.mp3.part")
        );
        assert!(paths.is_temp(Path::new("/tmp/ap/task-1/source.webm")));
        assert!(!paths.is_temp(Path::new("/tmp/ap/output/task-1.mp3")));
        assert!(!paths.is_temp(Path::new("/etc/passwd")));
    }
}

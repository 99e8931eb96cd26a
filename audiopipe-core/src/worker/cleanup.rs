use async_trait::async_trait;
use tracing::{debug, warn};

use super::{unexpected_payload, ArtifactPaths, StageHandler, StageOutcome, WorkerResult};
use crate::lifecycle::expiry::{remove_dir_if_present, remove_file_if_present};
use crate::queue::{Job, JobPayload, StageQueue};

/// Deletes a task's intermediate artifacts. Absent files are not an error.
pub struct CleanupHandler {
    paths: ArtifactPaths,
}

impl CleanupHandler {
    pub fn new(paths: ArtifactPaths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl StageHandler for CleanupHandler {
    fn stage(&self) -> StageQueue {
        StageQueue::Cleanup
    }

    async fn handle(&self, job: &Job) -> WorkerResult<StageOutcome> {
        let JobPayload::Cleanup { intermediate_path } = &job.payload else {
            return Err(unexpected_payload(job, StageQueue::Cleanup));
        };
        let work_dir = self.paths.work_dir(&job.task_id);
        let mut removed = remove_dir_if_present(&work_dir).await?;
        if !intermediate_path.starts_with(&work_dir) && self.paths.is_temp(intermediate_path) {
            removed |= remove_file_if_present(intermediate_path).await?.is_some();
        }
        debug!(task_id = %job.task_id, removed, "cleanup finished");
        Ok(StageOutcome::Completed)
    }

    async fn fail(&self, job: &Job, reason: &str) -> WorkerResult<()> {
        // The task outcome is already settled; the expiry sweep picks up leftovers.
        warn!(task_id = %job.task_id, reason, "cleanup gave up");
        Ok(())
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{info, warn};

use super::{
    mark_failed, unexpected_payload, ArtifactPaths, StageHandler, StageOutcome, WorkerError,
    WorkerResult,
};
use crate::capability::{CapabilityError, MediaFetcher};
use crate::lifecycle::expiry::remove_dir_if_present;
use crate::queue::{EnqueueOutcome, Job, JobDispatcher, JobPayload, StageQueue};
use crate::task::{SqliteTaskStore, TaskError, TaskMetadata, TaskPatch, TaskStage};
use crate::worker::TaskProgress;

const FETCH_BAND: (u8, u8) = (0, 50);

pub struct FetchHandler {
    store: SqliteTaskStore,
    dispatcher: Arc<dyn JobDispatcher>,
    fetcher: Arc<dyn MediaFetcher>,
    paths: ArtifactPaths,
}

impl FetchHandler {
    pub fn new(
        store: SqliteTaskStore,
        dispatcher: Arc<dyn JobDispatcher>,
        fetcher: Arc<dyn MediaFetcher>,
        paths: ArtifactPaths,
    ) -> Self {
        Self {
            store,
            dispatcher,
            fetcher,
            paths,
        }
    }
}

#[async_trait]
impl StageHandler for FetchHandler {
    fn stage(&self) -> StageQueue {
        StageQueue::Fetch
    }

    async fn handle(&self, job: &Job) -> WorkerResult<StageOutcome> {
        let JobPayload::Fetch { source_reference } = &job.payload else {
            return Err(unexpected_payload(job, StageQueue::Fetch));
        };
        let task_id = job.task_id.as_str();

        let claim = TaskPatch::new()
            .stage(TaskStage::Fetching)
            .message("Starting download...");
        let task = match self
            .store
            .transition_async(task_id, &[TaskStage::Pending, TaskStage::Fetching], &claim)
            .await
        {
            Ok(task) => task,
            Err(TaskError::StageConflict { actual, .. }) => {
                return Ok(StageOutcome::Skipped(format!("task is already {actual}")))
            }
            Err(TaskError::NotFound { .. }) => {
                return Ok(StageOutcome::Skipped("task no longer exists".into()))
            }
            Err(err) => return Err(err.into()),
        };
        if task.cancel_requested {
            return Err(CapabilityError::Cancelled.into());
        }

        // A redelivered job starts over from an empty work directory.
        let work_dir = self.paths.work_dir(task_id);
        remove_dir_if_present(&work_dir).await?;
        fs::create_dir_all(&work_dir)
            .await
            .map_err(|source| WorkerError::io(&work_dir, source))?;

        let sink = TaskProgress::new(
            self.store.clone(),
            task_id,
            TaskStage::Fetching,
            FETCH_BAND,
            "Downloading",
        );
        let output = self
            .fetcher
            .fetch(source_reference, &work_dir, &sink)
            .await?;

        let media = &output.metadata;
        let handed_off = TaskPatch::new()
            .progress(FETCH_BAND.1)
            .message("Download completed, waiting for conversion")
            .metadata(TaskMetadata {
                title: media.title.clone(),
                channel: media.channel.clone(),
                thumbnail: media.thumbnail.clone(),
            });
        match self
            .store
            .transition_async(task_id, &[TaskStage::Fetching], &handed_off)
            .await
        {
            Ok(_) => {}
            Err(TaskError::StageConflict { actual, .. }) => {
                return Ok(StageOutcome::Skipped(format!(
                    "task moved to {actual} during download"
                )))
            }
            Err(err) => return Err(err.into()),
        }

        let outcome = self
            .dispatcher
            .enqueue(
                task_id,
                JobPayload::Transcode {
                    intermediate_path: output.path.clone(),
                    duration_seconds: media.duration_seconds,
                },
            )
            .await?;
        if outcome == EnqueueOutcome::Duplicate {
            warn!(task_id, "transcode job already queued");
        }
        info!(
            task_id,
            path = %output.path.display(),
            title = media.title.as_deref().unwrap_or(""),
            "fetch complete"
        );
        Ok(StageOutcome::Completed)
    }

    async fn fail(&self, job: &Job, reason: &str) -> WorkerResult<()> {
        if let Some(stage) = mark_failed(&self.store, &job.task_id, reason).await? {
            // The task already finished; its files belong to later stages.
            warn!(task_id = %job.task_id, %stage, "fetch failure ignored for terminal task");
            return Ok(());
        }
        remove_dir_if_present(&self.paths.work_dir(&job.task_id)).await?;
        Ok(())
    }
}

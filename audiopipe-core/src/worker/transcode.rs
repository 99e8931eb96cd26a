use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{info, warn};

use super::{
    mark_failed, unexpected_payload, ArtifactPaths, StageHandler, StageOutcome, TaskProgress,
    WorkerError, WorkerResult,
};
use crate::capability::{CapabilityError, MediaTranscoder};
use crate::lifecycle::expiry::remove_file_if_present;
use crate::queue::{Job, JobDispatcher, JobPayload, StageQueue};
use crate::task::{Artifact, SqliteTaskStore, TaskError, TaskPatch, TaskStage};

const TRANSCODE_START: u8 = 60;
const TRANSCODE_BAND: (u8, u8) = (TRANSCODE_START, 99);

pub struct TranscodeHandler {
    store: SqliteTaskStore,
    dispatcher: Arc<dyn JobDispatcher>,
    transcoder: Arc<dyn MediaTranscoder>,
    paths: ArtifactPaths,
}

impl TranscodeHandler {
    pub fn new(
        store: SqliteTaskStore,
        dispatcher: Arc<dyn JobDispatcher>,
        transcoder: Arc<dyn MediaTranscoder>,
        paths: ArtifactPaths,
    ) -> Self {
        Self {
            store,
            dispatcher,
            transcoder,
            paths,
        }
    }

    async fn enqueue_cleanup(&self, task_id: &str, intermediate_path: &Path) -> WorkerResult<()> {
        self.dispatcher
            .enqueue(
                task_id,
                JobPayload::Cleanup {
                    intermediate_path: intermediate_path.to_path_buf(),
                },
            )
            .await?;
        Ok(())
    }

    /// Marks the task COMPLETED with `output`, then queues cleanup of the
    /// intermediate file.
    async fn finish(
        &self,
        task_id: &str,
        input: &Path,
        output: &Path,
        size_bytes: u64,
    ) -> WorkerResult<StageOutcome> {
        let done = TaskPatch::new()
            .stage(TaskStage::Completed)
            .progress(100)
            .message("done")
            .artifact(Artifact::new(output, size_bytes));
        let outcome = match self
            .store
            .transition_async(task_id, &[TaskStage::Transcoding], &done)
            .await
        {
            Ok(task) => {
                info!(
                    task_id,
                    size = %task.artifact.as_ref().map(|a| a.size_formatted.as_str()).unwrap_or(""),
                    "transcode complete"
                );
                StageOutcome::Completed
            }
            Err(TaskError::StageConflict { actual, .. }) => {
                if actual != TaskStage::Completed {
                    remove_file_if_present(output).await?;
                }
                StageOutcome::Skipped(format!("task moved to {actual} during transcode"))
            }
            Err(err) => return Err(err.into()),
        };
        self.enqueue_cleanup(task_id, input).await?;
        Ok(outcome)
    }

    async fn discard_outputs(&self, task_id: &str) -> WorkerResult<()> {
        remove_file_if_present(&self.paths.partial_output(task_id)).await?;
        remove_file_if_present(&self.paths.output(task_id)).await?;
        Ok(())
    }
}

fn intermediate_of(job: &Job) -> WorkerResult<(PathBuf, Option<u64>)> {
    match &job.payload {
        JobPayload::Transcode {
            intermediate_path,
            duration_seconds,
        } => Ok((intermediate_path.clone(), *duration_seconds)),
        _ => Err(unexpected_payload(job, StageQueue::Transcode)),
    }
}

#[async_trait]
impl StageHandler for TranscodeHandler {
    fn stage(&self) -> StageQueue {
        StageQueue::Transcode
    }

    async fn handle(&self, job: &Job) -> WorkerResult<StageOutcome> {
        let (input, duration) = intermediate_of(job)?;
        let task_id = job.task_id.as_str();

        let claim = TaskPatch::new()
            .stage(TaskStage::Transcoding)
            .progress(TRANSCODE_START)
            .message("Converting to MP3...");
        let task = match self
            .store
            .transition_async(
                task_id,
                &[TaskStage::Fetching, TaskStage::Transcoding],
                &claim,
            )
            .await
        {
            Ok(task) => task,
            Err(TaskError::StageConflict { actual, .. }) => {
                // A crash after COMPLETED may have lost the cleanup enqueue.
                if actual.terminal() {
                    self.enqueue_cleanup(task_id, &input).await?;
                }
                return Ok(StageOutcome::Skipped(format!("task is already {actual}")));
            }
            Err(TaskError::NotFound { .. }) => {
                return Ok(StageOutcome::Skipped("task no longer exists".into()))
            }
            Err(err) => return Err(err.into()),
        };
        if task.cancel_requested {
            return Err(CapabilityError::Cancelled.into());
        }

        let partial = self.paths.partial_output(task_id);
        let output = self.paths.output(task_id);
        if !fs::try_exists(&input).await.unwrap_or(false) {
            // An earlier delivery may have produced the output before it died.
            match fs::metadata(&output).await {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {
                    info!(task_id, "intermediate already gone, keeping finished output");
                    return self.finish(task_id, &input, &output, meta.len()).await;
                }
                _ => {
                    return Err(CapabilityError::NoMedia(format!(
                        "intermediate artifact {} is missing",
                        input.display()
                    ))
                    .into())
                }
            }
        }

        fs::create_dir_all(&self.paths.storage_dir)
            .await
            .map_err(|source| WorkerError::io(&self.paths.storage_dir, source))?;
        remove_file_if_present(&partial).await?;

        let sink = TaskProgress::new(
            self.store.clone(),
            task_id,
            TaskStage::Transcoding,
            TRANSCODE_BAND,
            "Converting to MP3",
        );
        self.transcoder
            .transcode(&input, &partial, duration, &sink)
            .await?;

        fs::rename(&partial, &output)
            .await
            .map_err(|source| WorkerError::io(&partial, source))?;
        let size_bytes = fs::metadata(&output)
            .await
            .map_err(|source| WorkerError::io(&output, source))?
            .len();
        if size_bytes == 0 {
            remove_file_if_present(&output).await?;
            return Err(CapabilityError::NoMedia("transcoder produced an empty file".into()).into());
        }

        self.finish(task_id, &input, &output, size_bytes).await
    }

    async fn fail(&self, job: &Job, reason: &str) -> WorkerResult<()> {
        let task_id = job.task_id.as_str();
        if let Ok((input, _)) = intermediate_of(job) {
            if let Err(err) = self.enqueue_cleanup(task_id, &input).await {
                warn!(task_id, error = %err, "could not queue cleanup after failure");
            }
        }
        match mark_failed(&self.store, task_id, reason).await? {
            Some(TaskStage::Completed) => {
                warn!(task_id, "transcode failure ignored for completed task");
                Ok(())
            }
            _ => self.discard_outputs(task_id).await,
        }
    }
}

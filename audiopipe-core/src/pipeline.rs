use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::capability::{MediaFetcher, MediaTranscoder};
use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::lifecycle::{
    ExpirySweeper, FileLifecycle, LifecycleError, ServedArtifact, TaskStatusView,
};
use crate::queue::{
    connect_dispatcher, DispatcherBackend, JobDispatcher, JobPayload, QueueCount, QueueError,
    StageQueue,
};
use crate::task::{NewTask, SqliteTaskStore, Task, TaskError, TaskMetadata, TaskStage};
use crate::worker::runner::JobDisposition;
use crate::worker::{
    ArtifactPaths, CleanupHandler, FetchHandler, RetryPolicy, StageHandler, StageOutcome,
    StageRunner, TranscodeHandler, WorkerPool,
};

const MAX_REFERENCE_LEN: usize = 2048;
const CLEANUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid source reference: {0}")]
    Validation(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("task {task_id} not found")]
    NotFound { task_id: String },
    #[error(transparent)]
    Store(TaskError),
    #[error(transparent)]
    Queue(QueueError),
    #[error(transparent)]
    Lifecycle(LifecycleError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl From<TaskError> for PipelineError {
    fn from(error: TaskError) -> Self {
        match error {
            err if err.is_unavailable() => PipelineError::ServiceUnavailable(err.to_string()),
            TaskError::NotFound { task_id } => PipelineError::NotFound { task_id },
            other => PipelineError::Store(other),
        }
    }
}

impl From<QueueError> for PipelineError {
    fn from(error: QueueError) -> Self {
        if error.is_unavailable() {
            PipelineError::ServiceUnavailable(error.to_string())
        } else {
            PipelineError::Queue(error)
        }
    }
}

impl From<LifecycleError> for PipelineError {
    fn from(error: LifecycleError) -> Self {
        match error {
            LifecycleError::NotFound { task_id } => PipelineError::NotFound { task_id },
            LifecycleError::Store(inner) => inner.into(),
            LifecycleError::Queue(inner) => inner.into(),
            other => PipelineError::Lifecycle(other),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitRequest {
    pub source_reference: String,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub thumbnail: Option<String>,
}

impl SubmitRequest {
    pub fn new(source_reference: impl Into<String>) -> Self {
        Self {
            source_reference: source_reference.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub stage: TaskStage,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub completed: usize,
    pub skipped: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.completed + self.skipped + self.retried + self.dead_lettered
    }

    fn record(&mut self, disposition: &JobDisposition) {
        match disposition {
            JobDisposition::Acked(StageOutcome::Completed) => self.completed += 1,
            JobDisposition::Acked(StageOutcome::Skipped(_)) => self.skipped += 1,
            JobDisposition::Retrying { .. } => self.retried += 1,
            JobDisposition::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub backend: DispatcherBackend,
    pub task_db: PathBuf,
    pub tasks: BTreeMap<String, usize>,
    pub jobs: Vec<QueueCount>,
}

/// Rejects references that cannot name a remote resource before any task exists.
pub fn validate_reference(reference: &str) -> PipelineResult<()> {
    if reference.trim().is_empty() {
        return Err(PipelineError::Validation("reference is empty".into()));
    }
    if reference.len() > MAX_REFERENCE_LEN {
        return Err(PipelineError::Validation(format!(
            "reference is longer than {MAX_REFERENCE_LEN} characters"
        )));
    }
    if reference
        .chars()
        .any(|ch| ch.is_whitespace() || ch.is_control())
    {
        return Err(PipelineError::Validation(
            "reference contains whitespace or control characters".into(),
        ));
    }
    if reference.contains("://") {
        let url = Url::parse(reference)
            .map_err(|err| PipelineError::Validation(format!("malformed url: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PipelineError::Validation(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(PipelineError::Validation("url has no host".into()));
        }
    }
    Ok(())
}

/// Gateway-facing entry point: submission, status, downloads and the wiring
/// for workers and the expiry sweep.
#[derive(Clone)]
pub struct AudioPipeline {
    config: PipelineConfig,
    store: SqliteTaskStore,
    dispatcher: Arc<dyn JobDispatcher>,
    lifecycle: FileLifecycle,
    paths: ArtifactPaths,
    retry: RetryPolicy,
}

impl AudioPipeline {
    pub async fn connect(config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        let store = SqliteTaskStore::builder()
            .path(&config.store.task_db)
            .ttl(config.artifact_ttl())
            .build()?;
        store.initialize().map_err(|err| {
            PipelineError::ServiceUnavailable(format!("task store: {err}"))
        })?;
        let dispatcher = connect_dispatcher(&config)?;
        Self::from_parts(config, store, dispatcher).await
    }

    /// Assembles a pipeline around an already-initialised store and dispatcher.
    pub async fn from_parts(
        config: PipelineConfig,
        store: SqliteTaskStore,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> PipelineResult<Self> {
        let paths = ArtifactPaths::from_config(&config);
        paths.ensure().await.map_err(|source| PipelineError::Io {
            path: paths.storage_dir.clone(),
            source,
        })?;
        Ok(Self {
            retry: RetryPolicy::from_config(&config.retry),
            lifecycle: FileLifecycle::new(store.clone()),
            config,
            store,
            dispatcher,
            paths,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteTaskStore {
        &self.store
    }

    pub fn dispatcher(&self) -> Arc<dyn JobDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    pub async fn submit(&self, request: SubmitRequest) -> PipelineResult<SubmitReceipt> {
        validate_reference(&request.source_reference)?;
        let new = NewTask::new(&request.source_reference).with_metadata(TaskMetadata {
            title: request.title,
            channel: request.channel,
            thumbnail: request.thumbnail,
        });
        let task = self.store.create(&new)?;

        let payload = JobPayload::Fetch {
            source_reference: request.source_reference,
        };
        if let Err(err) = self.dispatcher.enqueue(&task.id, payload).await {
            if let Err(delete_err) = self.store.delete(&task.id) {
                warn!(task_id = %task.id, error = %delete_err, "could not roll back task");
            }
            return Err(PipelineError::ServiceUnavailable(format!(
                "could not queue task: {err}"
            )));
        }
        info!(task_id = %task.id, backend = %self.dispatcher.backend(), "task submitted");
        Ok(SubmitReceipt {
            task_id: task.id,
            stage: task.stage,
            message: task.message,
        })
    }

    pub fn status(&self, task_id: &str) -> PipelineResult<TaskStatusView> {
        self.status_at(task_id, Utc::now())
    }

    pub fn status_at(&self, task_id: &str, now: DateTime<Utc>) -> PipelineResult<TaskStatusView> {
        Ok(self.lifecycle.status(task_id, now)?)
    }

    pub async fn download(&self, task_id: &str) -> PipelineResult<ServedArtifact> {
        self.download_at(task_id, Utc::now()).await
    }

    pub async fn download_at(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<ServedArtifact> {
        Ok(self.lifecycle.serve(task_id, now).await?)
    }

    pub fn cancel(&self, task_id: &str) -> PipelineResult<Task> {
        let task = self.store.request_cancel(task_id)?;
        info!(task_id, stage = %task.stage, "cancellation requested");
        Ok(task)
    }

    pub fn remaining_ttl(&self, task_id: &str) -> PipelineResult<Duration> {
        Ok(self.lifecycle.remaining_ttl(task_id, Utc::now())?)
    }

    pub fn runner(
        &self,
        stage: StageQueue,
        fetcher: Arc<dyn MediaFetcher>,
        transcoder: Arc<dyn MediaTranscoder>,
    ) -> StageRunner {
        let handler: Arc<dyn StageHandler> = match stage {
            StageQueue::Fetch => Arc::new(FetchHandler::new(
                self.store.clone(),
                self.dispatcher(),
                fetcher,
                self.paths.clone(),
            )),
            StageQueue::Transcode => Arc::new(TranscodeHandler::new(
                self.store.clone(),
                self.dispatcher(),
                transcoder,
                self.paths.clone(),
            )),
            StageQueue::Cleanup => Arc::new(CleanupHandler::new(self.paths.clone())),
        };
        let stage_timeout = match stage {
            StageQueue::Fetch => self.config.fetch_timeout(),
            StageQueue::Transcode => self.config.transcode_timeout(),
            StageQueue::Cleanup => CLEANUP_TIMEOUT,
        };
        StageRunner::new(handler, self.dispatcher(), self.retry.clone(), stage_timeout)
    }

    pub fn default_concurrency(&self, stage: StageQueue) -> usize {
        match stage {
            StageQueue::Fetch => self.config.limits.max_concurrent_downloads as usize,
            StageQueue::Transcode => self.config.limits.max_concurrent_transcodes as usize,
            StageQueue::Cleanup => 1,
        }
    }

    /// Spawns runners for `stages`. Fetch concurrency is capped by the pool
    /// size, so an explicit `concurrency` never exceeds the configured limit.
    pub fn start_workers(
        &self,
        stages: &[StageQueue],
        fetcher: Arc<dyn MediaFetcher>,
        transcoder: Arc<dyn MediaTranscoder>,
        concurrency: Option<usize>,
    ) -> WorkerPool {
        let mut pool = WorkerPool::new();
        for &stage in stages {
            let limit = self.default_concurrency(stage);
            let count = concurrency.map_or(limit, |requested| requested.min(limit).max(1));
            let runner = self.runner(stage, Arc::clone(&fetcher), Arc::clone(&transcoder));
            pool.spawn(runner, count);
        }
        info!(runners = pool.len(), backend = %self.dispatcher.backend(), "workers started");
        pool
    }

    /// Runs every ready job in this process until no stage has work left.
    /// Jobs waiting out a retry delay are left in the queue.
    pub async fn drain(
        &self,
        fetcher: Arc<dyn MediaFetcher>,
        transcoder: Arc<dyn MediaTranscoder>,
    ) -> PipelineResult<DrainReport> {
        let runners: Vec<StageRunner> = StageQueue::ALL
            .iter()
            .map(|&stage| self.runner(stage, Arc::clone(&fetcher), Arc::clone(&transcoder)))
            .collect();
        let mut report = DrainReport::default();
        loop {
            let mut progressed = false;
            for runner in &runners {
                while let Some(disposition) = runner.run_once().await? {
                    report.record(&disposition);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(report)
    }

    pub fn sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::new(self.store.clone(), self.dispatcher(), &self.config)
    }

    pub async fn health(&self) -> PipelineResult<HealthReport> {
        let tasks = self
            .store
            .count_by_stage()?
            .into_iter()
            .map(|(stage, count)| (stage.as_str().to_string(), count))
            .collect();
        let jobs = self.dispatcher.counts().await?;
        Ok(HealthReport {
            backend: self.dispatcher.backend(),
            task_db: self.config.store.task_db.clone(),
            tasks,
            jobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_opaque_and_http_references() {
        assert!(validate_reference("ref-ok-3min").is_ok());
        assert!(validate_reference("https://www.youtube.com/watch?v=dQw4w9WgXcQ").is_ok());
        assert!(validate_reference("http://example.com/a.mp4").is_ok());
    }

    #[test]
    fn rejects_malformed_references() {
        for bad in [
            "",
            "   ",
            "has space",
            "tab\there",
            "ftp://example.com/file",
            "https://",
            "javascript://alert(1)",
        ] {
            assert!(
                matches!(validate_reference(bad), Err(PipelineError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
        let long = format!("https://example.com/{}", "a".repeat(MAX_REFERENCE_LEN));
        assert!(validate_reference(&long).is_err());
    }

    #[test]
    fn store_outages_surface_as_unavailable() {
        let err: PipelineError = TaskError::NotFound {
            task_id: "task-x".into(),
        }
        .into();
        assert!(matches!(err, PipelineError::NotFound { .. }));

        let err: PipelineError = QueueError::ServiceUnavailable("down".into()).into();
        assert!(matches!(err, PipelineError::ServiceUnavailable(_)));
    }
}

//! Serving finished artifacts and evicting expired ones.

pub mod expiry;
pub mod format;

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs::File;
use tracing::info;

use crate::task::{SqliteTaskStore, Task, TaskError, TaskStage};

pub use expiry::{ExpirySweeper, SweepReport};
pub use format::{expires_text, format_size, suggested_filename};

pub const AUDIO_CONTENT_TYPE: &str = "audio/mpeg";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("task {task_id} not found")]
    NotFound { task_id: String },
    #[error("task {task_id} is not ready (stage {stage})")]
    NotReady { task_id: String, stage: TaskStage },
    #[error("task {task_id} has expired")]
    Expired { task_id: String },
    #[error("artifact for task {task_id} is missing at {path}")]
    ArtifactMissing { task_id: String, path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] TaskError),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

impl LifecycleError {
    /// Errors a gateway should report as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LifecycleError::NotFound { .. } | LifecycleError::ArtifactMissing { .. }
        )
    }
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// An open artifact ready to stream, with the headers a gateway needs.
#[derive(Debug)]
pub struct ServedArtifact {
    pub file: File,
    pub path: PathBuf,
    pub content_type: &'static str,
    pub filename: String,
    pub size_bytes: u64,
    pub download_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub stage: TaskStage,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_size_formatted: Option<String>,
    pub download_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_text: Option<String>,
}

impl TaskStatusView {
    pub fn from_task(task: &Task, now: DateTime<Utc>) -> Self {
        let servable = task.stage == TaskStage::Completed && !task.is_expired(now);
        let remaining = task.remaining_ttl(now);
        Self {
            task_id: task.id.clone(),
            stage: task.stage,
            progress: task.progress,
            message: task.message.clone(),
            title: task.metadata.title.clone(),
            channel: task.metadata.channel.clone(),
            thumbnail: task.metadata.thumbnail.clone(),
            error: task.error.clone(),
            artifact_size: task.artifact.as_ref().map(|artifact| artifact.size_bytes),
            artifact_size_formatted: task
                .artifact
                .as_ref()
                .map(|artifact| artifact.size_formatted.clone()),
            download_count: task.download_count,
            expires_in_seconds: servable.then(|| remaining.num_seconds()),
            expires_text: servable.then(|| expires_text(remaining)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileLifecycle {
    store: SqliteTaskStore,
}

impl FileLifecycle {
    pub fn new(store: SqliteTaskStore) -> Self {
        Self { store }
    }

    /// Opens the artifact of a completed, unexpired task and counts the download.
    pub async fn serve(&self, task_id: &str, now: DateTime<Utc>) -> LifecycleResult<ServedArtifact> {
        let task = self.load(task_id)?;
        if task.stage != TaskStage::Completed {
            return Err(LifecycleError::NotReady {
                task_id: task_id.to_string(),
                stage: task.stage,
            });
        }
        if task.is_expired(now) {
            return Err(LifecycleError::Expired {
                task_id: task_id.to_string(),
            });
        }
        let artifact = task.artifact.as_ref().ok_or_else(|| LifecycleError::ArtifactMissing {
            task_id: task_id.to_string(),
            path: PathBuf::new(),
        })?;

        let file = match File::open(&artifact.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(LifecycleError::ArtifactMissing {
                    task_id: task_id.to_string(),
                    path: artifact.path.clone(),
                })
            }
            Err(source) => {
                return Err(LifecycleError::Io {
                    path: artifact.path.clone(),
                    source,
                })
            }
        };
        let size_bytes = file
            .metadata()
            .await
            .map_err(|source| LifecycleError::Io {
                path: artifact.path.clone(),
                source,
            })?
            .len();

        let download_count = self
            .store
            .record_download(task_id, now)
            .map_err(|err| match err {
                TaskError::NotFound { task_id } => LifecycleError::NotFound { task_id },
                TaskError::Expired { task_id } => LifecycleError::Expired { task_id },
                TaskError::StageConflict { task_id, actual } => LifecycleError::NotReady {
                    task_id,
                    stage: actual,
                },
                other => LifecycleError::Store(other),
            })?;
        info!(task_id, download_count, size_bytes, "serving artifact");

        Ok(ServedArtifact {
            file,
            path: artifact.path.clone(),
            content_type: AUDIO_CONTENT_TYPE,
            filename: suggested_filename(task.metadata.title.as_deref(), task_id),
            size_bytes,
            download_count,
        })
    }

    pub fn status(&self, task_id: &str, now: DateTime<Utc>) -> LifecycleResult<TaskStatusView> {
        let task = self.load(task_id)?;
        Ok(TaskStatusView::from_task(&task, now))
    }

    pub fn remaining_ttl(&self, task_id: &str, now: DateTime<Utc>) -> LifecycleResult<Duration> {
        Ok(self.load(task_id)?.remaining_ttl(now))
    }

    fn load(&self, task_id: &str) -> LifecycleResult<Task> {
        self.store
            .find(task_id)?
            .ok_or_else(|| LifecycleError::NotFound {
                task_id: task_id.to_string(),
            })
    }
}

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::error::TaskError;
use crate::lifecycle::format_size;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Pending,
    Fetching,
    Transcoding,
    Completed,
    Failed,
}

impl TaskStage {
    pub const ALL: [TaskStage; 5] = [
        TaskStage::Pending,
        TaskStage::Fetching,
        TaskStage::Transcoding,
        TaskStage::Completed,
        TaskStage::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStage::Pending => "pending",
            TaskStage::Fetching => "fetching",
            TaskStage::Transcoding => "transcoding",
            TaskStage::Completed => "completed",
            TaskStage::Failed => "failed",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, TaskStage::Completed | TaskStage::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStage::Pending => 0,
            TaskStage::Fetching => 1,
            TaskStage::Transcoding => 2,
            TaskStage::Completed => 3,
            TaskStage::Failed => 4,
        }
    }

    /// Forward moves along pending → fetching → transcoding → completed, one
    /// step at a time, or from any non-terminal stage into failed.
    pub fn can_transition_to(&self, next: TaskStage) -> bool {
        if self.terminal() {
            return false;
        }
        if next == TaskStage::Failed {
            return true;
        }
        next.rank() == self.rank() + 1
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStage::Pending),
            "fetching" => Ok(TaskStage::Fetching),
            "transcoding" => Ok(TaskStage::Transcoding),
            "completed" => Ok(TaskStage::Completed),
            "failed" => Ok(TaskStage::Failed),
            other => Err(format!("unknown task stage: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskMetadata {
    pub title: Option<String>,
    pub channel: Option<String>,
    pub thumbnail: Option<String>,
}

impl TaskMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.channel.is_none() && self.thumbnail.is_none()
    }

    /// Newer values win; an absent value never clears an existing one.
    pub fn merge(&mut self, other: &TaskMetadata) {
        if other.title.is_some() {
            self.title = other.title.clone();
        }
        if other.channel.is_some() {
            self.channel = other.channel.clone();
        }
        if other.thumbnail.is_some() {
            self.thumbnail = other.thumbnail.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub size_formatted: String,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            size_formatted: format_size(size_bytes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub source_reference: String,
    pub stage: TaskStage,
    pub progress: u8,
    pub message: String,
    pub metadata: TaskMetadata,
    pub error: Option<String>,
    pub artifact: Option<Artifact>,
    pub download_count: u64,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Task {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: NaiveDateTime = row.get("created_at")?;
        let updated_at: NaiveDateTime = row.get("updated_at")?;
        let expires_at: NaiveDateTime = row.get("expires_at")?;
        let artifact_path: Option<String> = row.get("artifact_path")?;
        let artifact = match artifact_path {
            Some(path) => Some(Artifact {
                path: PathBuf::from(path),
                size_bytes: row.get::<_, Option<i64>>("artifact_size")?.unwrap_or(0).max(0) as u64,
                size_formatted: row
                    .get::<_, Option<String>>("artifact_size_formatted")?
                    .unwrap_or_default(),
            }),
            None => None,
        };
        Ok(Self {
            id: row.get("id")?,
            source_reference: row.get("source_reference")?,
            stage: row
                .get::<_, String>("stage")?
                .parse()
                .unwrap_or(TaskStage::Failed),
            progress: row.get::<_, i64>("progress")?.clamp(0, 100) as u8,
            message: row.get("message")?,
            metadata: TaskMetadata {
                title: row.get("title")?,
                channel: row.get("channel")?,
                thumbnail: row.get("thumbnail")?,
            },
            error: row.get("error")?,
            artifact,
            download_count: row.get::<_, i64>("download_count")?.max(0) as u64,
            cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
            created_at: Utc.from_utc_datetime(&created_at),
            updated_at: Utc.from_utc_datetime(&updated_at),
            expires_at: Utc.from_utc_datetime(&expires_at),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// Produces the record that results from merging `patch` into `self`,
    /// or explains why the merge would break a record invariant.
    pub fn apply_patch(&self, patch: &TaskPatch, now: DateTime<Utc>) -> Result<Task, TaskError> {
        if self.stage.terminal() && patch.touches_state() {
            return Err(TaskError::StageConflict {
                task_id: self.id.clone(),
                actual: self.stage,
            });
        }

        let next_stage = patch.stage.unwrap_or(self.stage);
        if next_stage != self.stage && !self.stage.can_transition_to(next_stage) {
            return Err(TaskError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.stage,
                to: next_stage,
            });
        }

        if patch.artifact.is_some() && next_stage != TaskStage::Completed {
            return Err(self.invalid("artifact may only be recorded on a completed task"));
        }
        if next_stage == TaskStage::Completed
            && patch.artifact.is_none()
            && self.artifact.is_none()
        {
            return Err(self.invalid("completed task requires an artifact"));
        }
        if patch.error.is_some() && next_stage != TaskStage::Failed {
            return Err(self.invalid("error may only be recorded on a failed task"));
        }
        if next_stage == TaskStage::Failed && patch.error.is_none() && self.error.is_none() {
            return Err(self.invalid("failed task requires an error"));
        }

        let mut next = self.clone();
        next.stage = next_stage;
        if let Some(progress) = patch.progress {
            next.progress = next.progress.max(progress.min(100));
        }
        if let Some(message) = &patch.message {
            next.message = message.clone();
        }
        if let Some(metadata) = &patch.metadata {
            next.metadata.merge(metadata);
        }
        if let Some(error) = &patch.error {
            next.error = Some(error.clone());
        }
        if let Some(artifact) = &patch.artifact {
            next.artifact = Some(artifact.clone());
        }
        next.updated_at = now;
        Ok(next)
    }

    fn invalid(&self, reason: &str) -> TaskError {
        TaskError::InvalidPatch {
            task_id: self.id.clone(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub source_reference: String,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl NewTask {
    pub fn new(source_reference: impl Into<String>) -> Self {
        Self {
            source_reference: source_reference.into(),
            metadata: TaskMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Partial update merged into a task by the store. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub stage: Option<TaskStage>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub metadata: Option<TaskMetadata>,
    pub error: Option<String>,
    pub artifact: Option<Artifact>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: TaskStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new()
            .stage(TaskStage::Failed)
            .message(format!("Failed: {error}"))
            .error(error)
    }

    pub fn is_empty(&self) -> bool {
        *self == TaskPatch::default()
    }

    fn touches_state(&self) -> bool {
        self.stage.is_some()
            || self.progress.is_some()
            || self.message.is_some()
            || self.error.is_some()
            || self.artifact.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub stage: Option<TaskStage>,
    pub limit: Option<usize>,
}

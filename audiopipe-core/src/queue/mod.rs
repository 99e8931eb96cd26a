//! Stage queues: one logical queue per pipeline stage with leased,
//! at-least-once delivery.
//!
//! A claimed job stays invisible to other consumers until its lease runs out.
//! Holders must `ack` or `nack` with the lease they were given; a job whose
//! lease expired is handed to the next caller of `try_dequeue`.

pub mod error;
pub mod local;
pub mod connect;
pub mod sqlite;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;

pub use error::{QueueError, QueueResult};
pub use local::LocalJobQueue;
pub use connect::connect_dispatcher;
pub use sqlite::{SqliteJobQueue, SqliteJobQueueBuilder};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageQueue {
    Fetch,
    Transcode,
    Cleanup,
}

impl StageQueue {
    pub const ALL: [StageQueue; 3] = [StageQueue::Fetch, StageQueue::Transcode, StageQueue::Cleanup];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageQueue::Fetch => "fetch",
            StageQueue::Transcode => "transcode",
            StageQueue::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for StageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageQueue {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(StageQueue::Fetch),
            "transcode" => Ok(StageQueue::Transcode),
            "cleanup" => Ok(StageQueue::Cleanup),
            other => Err(QueueError::InvalidQueue(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Fetch {
        source_reference: String,
    },
    Transcode {
        intermediate_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<u64>,
    },
    Cleanup {
        intermediate_path: PathBuf,
    },
}

impl JobPayload {
    pub fn queue(&self) -> StageQueue {
        match self {
            JobPayload::Fetch { .. } => StageQueue::Fetch,
            JobPayload::Transcode { .. } => StageQueue::Transcode,
            JobPayload::Cleanup { .. } => StageQueue::Cleanup,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    InFlight,
    Done,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::InFlight => "in_flight",
            JobState::Done => "done",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(JobState::Ready),
            "in_flight" => Ok(JobState::InFlight),
            "done" => Ok(JobState::Done),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::InvalidQueue(other.to_string())),
        }
    }
}

/// A claimed job. `lease_token` proves ownership until `leased_until`.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub queue: StageQueue,
    pub task_id: String,
    pub payload: JobPayload,
    pub attempts: u32,
    pub lease_token: String,
    pub leased_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(i64),
    /// A job for this task already exists on the queue.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueCount {
    pub queue: StageQueue,
    pub state: JobState,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherBackend {
    Durable,
    Local,
}

impl fmt::Display for DispatcherBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatcherBackend::Durable => f.write_str("durable"),
            DispatcherBackend::Local => f.write_str("local"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub fetch_visibility: Duration,
    pub transcode_visibility: Duration,
    pub cleanup_visibility: Duration,
    pub poll_interval: StdDuration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl QueueSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let grace = config.queue.lease_grace_seconds as i64;
        Self {
            fetch_visibility: Duration::seconds(config.timeouts.fetch_seconds as i64 + grace),
            transcode_visibility: Duration::seconds(
                config.timeouts.transcode_seconds as i64 + grace,
            ),
            cleanup_visibility: Duration::seconds(120),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn visibility(&self, queue: StageQueue) -> Duration {
        match queue {
            StageQueue::Fetch => self.fetch_visibility,
            StageQueue::Transcode => self.transcode_visibility,
            StageQueue::Cleanup => self.cleanup_visibility,
        }
    }
}

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    fn backend(&self) -> DispatcherBackend;

    fn poll_interval(&self) -> StdDuration;

    async fn enqueue(&self, task_id: &str, payload: JobPayload) -> QueueResult<EnqueueOutcome>;

    /// Claims the oldest available job on `queue`, if any.
    async fn try_dequeue(&self, queue: StageQueue) -> QueueResult<Option<Job>>;

    /// Waits until a job on `queue` can be claimed.
    async fn dequeue(&self, queue: StageQueue) -> QueueResult<Job> {
        loop {
            if let Some(job) = self.try_dequeue(queue).await? {
                return Ok(job);
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    async fn ack(&self, job: &Job) -> QueueResult<()>;

    /// Releases the job. `Some(delay)` makes it visible again after `delay`;
    /// `None` moves it to the dead-letter state.
    async fn nack(&self, job: &Job, retry_in: Option<StdDuration>, reason: &str)
        -> QueueResult<()>;

    /// Drops every job belonging to `task_id`, whatever its state.
    async fn purge_task(&self, task_id: &str) -> QueueResult<usize>;

    async fn counts(&self) -> QueueResult<Vec<QueueCount>>;
}

pub(crate) fn lease_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn chrono_delay(delay: StdDuration) -> Duration {
    Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(i64::from(u32::MAX)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged_json() {
        let payload = JobPayload::Transcode {
            intermediate_path: PathBuf::from("/tmp/t/task-1/source.webm"),
            duration_seconds: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"transcode","intermediate_path":"/tmp/t/task-1/source.webm"}"#
        );
        assert_eq!(payload.queue(), StageQueue::Transcode);
    }

    #[test]
    fn visibility_includes_grace() {
        let settings = QueueSettings::default();
        assert_eq!(settings.visibility(StageQueue::Fetch), Duration::seconds(660));
        assert_eq!(settings.visibility(StageQueue::Transcode), Duration::seconds(960));
        assert_eq!(settings.visibility(StageQueue::Cleanup), Duration::seconds(120));
    }
}

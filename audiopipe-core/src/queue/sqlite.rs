use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::error::{QueueError, QueueResult};
use super::{
    chrono_delay, lease_token, DispatcherBackend, EnqueueOutcome, Job, JobDispatcher, JobPayload,
    JobState, QueueCount, QueueSettings, StageQueue,
};
use crate::sqlite::{open_configured, open_flags};

const JOBS_SCHEMA: &str = include_str!("../../../sql/jobs.sql");

#[derive(Debug, Clone)]
pub struct SqliteJobQueueBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
    settings: QueueSettings,
}

impl Default for SqliteJobQueueBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
            settings: QueueSettings::default(),
        }
    }
}

impl SqliteJobQueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> QueueResult<SqliteJobQueue> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        Ok(SqliteJobQueue {
            path,
            flags: open_flags(false, self.create_if_missing),
            settings: self.settings,
        })
    }
}

/// Durable job queue shared by every worker process pointing at the same file.
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    path: PathBuf,
    flags: OpenFlags,
    settings: QueueSettings,
}

impl SqliteJobQueue {
    pub fn builder() -> SqliteJobQueueBuilder {
        SqliteJobQueueBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> QueueResult<Self> {
        SqliteJobQueueBuilder::new().path(path).build()
    }

    fn open(&self) -> QueueResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> QueueResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(JOBS_SCHEMA)?;
        Ok(())
    }

    /// Trivial round trip used at startup to decide whether the queue is usable.
    pub fn ping(&self) -> QueueResult<()> {
        let conn = self.open()?;
        conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    pub fn enqueue_at(
        &self,
        task_id: &str,
        payload: &JobPayload,
        now: DateTime<Utc>,
    ) -> QueueResult<EnqueueOutcome> {
        let conn = self.open()?;
        let queue = payload.queue();
        let body = serde_json::to_string(payload)?;
        let ts = now.naive_utc();
        let inserted = conn.execute(
            "INSERT INTO jobs (queue, task_id, payload, state, attempts, available_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'ready', 0, ?4, ?4, ?4)
             ON CONFLICT (queue, task_id) DO NOTHING",
            params![queue.as_str(), task_id, body, ts],
        )?;
        if inserted == 0 {
            debug!(task_id, queue = %queue, "duplicate enqueue ignored");
            return Ok(EnqueueOutcome::Duplicate);
        }
        Ok(EnqueueOutcome::Enqueued(conn.last_insert_rowid()))
    }

    /// Claims the oldest ready job, or an in-flight job whose lease lapsed.
    pub fn claim_at(&self, queue: StageQueue, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ts = now.naive_utc();
        let candidate = tx
            .query_row(
                "SELECT id, task_id, payload, attempts FROM jobs
                 WHERE queue = ?1
                   AND ((state = 'ready' AND available_at <= ?2)
                     OR (state = 'in_flight' AND leased_until <= ?2))
                 ORDER BY available_at ASC, id ASC
                 LIMIT 1",
                params![queue.as_str(), ts],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, task_id, body, attempts)) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let payload: JobPayload = match serde_json::from_str(&body) {
            Ok(payload) => payload,
            Err(err) => {
                tx.execute(
                    "UPDATE jobs SET state = 'dead', last_error = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, format!("undecodable payload: {err}"), ts],
                )?;
                tx.commit()?;
                return Err(err.into());
            }
        };

        let token = lease_token();
        let leased_until = now + self.settings.visibility(queue);
        tx.execute(
            "UPDATE jobs SET state = 'in_flight', attempts = attempts + 1, lease_token = ?2,
                leased_until = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, &token, leased_until.naive_utc(), ts],
        )?;
        tx.commit()?;

        Ok(Some(Job {
            id,
            queue,
            task_id,
            payload,
            attempts: (attempts + 1).max(0) as u32,
            lease_token: token,
            leased_until,
        }))
    }

    pub fn ack_at(&self, job: &Job, now: DateTime<Utc>) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE jobs SET state = 'done', lease_token = NULL, leased_until = NULL, updated_at = ?3
             WHERE id = ?1 AND lease_token = ?2 AND state = 'in_flight'",
            params![job.id, &job.lease_token, now.naive_utc()],
        )?;
        if affected == 0 {
            return Err(QueueError::LeaseLost { job_id: job.id });
        }
        Ok(())
    }

    pub fn nack_at(
        &self,
        job: &Job,
        retry_in: Option<StdDuration>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = match retry_in {
            Some(delay) => conn.execute(
                "UPDATE jobs SET state = 'ready', available_at = ?3, lease_token = NULL,
                    leased_until = NULL, last_error = ?4, updated_at = ?5
                 WHERE id = ?1 AND lease_token = ?2 AND state = 'in_flight'",
                params![
                    job.id,
                    &job.lease_token,
                    (now + chrono_delay(delay)).naive_utc(),
                    reason,
                    now.naive_utc()
                ],
            )?,
            None => conn.execute(
                "UPDATE jobs SET state = 'dead', lease_token = NULL, leased_until = NULL,
                    last_error = ?3, updated_at = ?4
                 WHERE id = ?1 AND lease_token = ?2 AND state = 'in_flight'",
                params![job.id, &job.lease_token, reason, now.naive_utc()],
            )?,
        };
        if affected == 0 {
            return Err(QueueError::LeaseLost { job_id: job.id });
        }
        Ok(())
    }

    pub fn purge_task_blocking(&self, task_id: &str) -> QueueResult<usize> {
        let conn = self.open()?;
        Ok(conn.execute("DELETE FROM jobs WHERE task_id = ?1", [task_id])?)
    }

    pub fn counts_blocking(&self) -> QueueResult<Vec<QueueCount>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT queue, state, COUNT(*) FROM jobs GROUP BY queue, state ORDER BY queue, state",
        )?;
        let mut rows = stmt.query([])?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next()? {
            let queue: String = row.get(0)?;
            let state: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            counts.push(QueueCount {
                queue: queue.parse()?,
                state: state.parse()?,
                count: count.max(0) as usize,
            });
        }
        Ok(counts)
    }

    /// Most recent `last_error` recorded for a task's job on `queue`.
    pub fn last_error(&self, queue: StageQueue, task_id: &str) -> QueueResult<Option<String>> {
        let conn = self.open()?;
        let error: Option<Option<String>> = conn
            .query_row(
                "SELECT last_error FROM jobs WHERE queue = ?1 AND task_id = ?2",
                params![queue.as_str(), task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(error.flatten())
    }

    pub fn job_state(&self, queue: StageQueue, task_id: &str) -> QueueResult<Option<JobState>> {
        let conn = self.open()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM jobs WHERE queue = ?1 AND task_id = ?2",
                params![queue.as_str(), task_id],
                |row| row.get(0),
            )
            .optional()?;
        state.map(|value| value.parse()).transpose()
    }
}

#[async_trait]
impl JobDispatcher for SqliteJobQueue {
    fn backend(&self) -> DispatcherBackend {
        DispatcherBackend::Durable
    }

    fn poll_interval(&self) -> StdDuration {
        self.settings.poll_interval
    }

    async fn enqueue(&self, task_id: &str, payload: JobPayload) -> QueueResult<EnqueueOutcome> {
        let queue = self.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || queue.enqueue_at(&task_id, &payload, Utc::now()))
            .await?
    }

    async fn try_dequeue(&self, stage: StageQueue) -> QueueResult<Option<Job>> {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || queue.claim_at(stage, Utc::now())).await?
    }

    async fn ack(&self, job: &Job) -> QueueResult<()> {
        let queue = self.clone();
        let job = job.clone();
        tokio::task::spawn_blocking(move || queue.ack_at(&job, Utc::now())).await?
    }

    async fn nack(
        &self,
        job: &Job,
        retry_in: Option<StdDuration>,
        reason: &str,
    ) -> QueueResult<()> {
        let queue = self.clone();
        let job = job.clone();
        let reason = reason.to_string();
        tokio::task::spawn_blocking(move || queue.nack_at(&job, retry_in, &reason, Utc::now()))
            .await?
    }

    async fn purge_task(&self, task_id: &str) -> QueueResult<usize> {
        let queue = self.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || queue.purge_task_blocking(&task_id)).await?
    }

    async fn counts(&self) -> QueueResult<Vec<QueueCount>> {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || queue.counts_blocking()).await?
    }
}

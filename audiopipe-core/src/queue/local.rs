use std::collections::{BTreeMap, HashMap};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use super::error::{QueueError, QueueResult};
use super::{
    chrono_delay, lease_token, DispatcherBackend, EnqueueOutcome, Job, JobDispatcher, JobPayload,
    JobState, QueueCount, QueueSettings, StageQueue,
};

#[derive(Debug)]
struct LocalJob {
    queue: StageQueue,
    task_id: String,
    payload: JobPayload,
    state: JobState,
    attempts: u32,
    available_at: DateTime<Utc>,
    lease_token: Option<String>,
    leased_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct LocalState {
    next_id: i64,
    jobs: BTreeMap<i64, LocalJob>,
}

/// In-process queue with the same lease and dedupe rules as the durable one.
/// Jobs are lost when the process exits.
#[derive(Debug)]
pub struct LocalJobQueue {
    state: Mutex<LocalState>,
    notify: Notify,
    settings: QueueSettings,
}

impl Default for LocalJobQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

impl LocalJobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            notify: Notify::new(),
            settings,
        }
    }

    pub async fn last_error(&self, queue: StageQueue, task_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .find(|job| job.queue == queue && job.task_id == task_id)
            .and_then(|job| job.last_error.clone())
    }

    pub async fn job_state(&self, queue: StageQueue, task_id: &str) -> Option<JobState> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .find(|job| job.queue == queue && job.task_id == task_id)
            .map(|job| job.state)
    }

    async fn claim(&self, queue: StageQueue, now: DateTime<Utc>) -> Option<Job> {
        let mut state = self.state.lock().await;
        let (id, job) = state
            .jobs
            .iter_mut()
            .filter(|(_, job)| job.queue == queue)
            .filter(|(_, job)| match job.state {
                JobState::Ready => job.available_at <= now,
                JobState::InFlight => job.leased_until.is_some_and(|until| until <= now),
                JobState::Done | JobState::Dead => false,
            })
            .min_by_key(|(id, job)| (job.available_at, **id))?;

        let token = lease_token();
        let leased_until = now + self.settings.visibility(queue);
        job.state = JobState::InFlight;
        job.attempts += 1;
        job.lease_token = Some(token.clone());
        job.leased_until = Some(leased_until);

        Some(Job {
            id: *id,
            queue,
            task_id: job.task_id.clone(),
            payload: job.payload.clone(),
            attempts: job.attempts,
            lease_token: token,
            leased_until,
        })
    }

    async fn settle(
        &self,
        job: &Job,
        next: JobState,
        available_at: Option<DateTime<Utc>>,
        reason: Option<&str>,
    ) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .jobs
            .get_mut(&job.id)
            .filter(|entry| {
                entry.state == JobState::InFlight
                    && entry.lease_token.as_deref() == Some(job.lease_token.as_str())
            })
            .ok_or(QueueError::LeaseLost { job_id: job.id })?;
        entry.state = next;
        entry.lease_token = None;
        entry.leased_until = None;
        if let Some(at) = available_at {
            entry.available_at = at;
        }
        if let Some(reason) = reason {
            entry.last_error = Some(reason.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl JobDispatcher for LocalJobQueue {
    fn backend(&self) -> DispatcherBackend {
        DispatcherBackend::Local
    }

    fn poll_interval(&self) -> StdDuration {
        self.settings.poll_interval
    }

    async fn enqueue(&self, task_id: &str, payload: JobPayload) -> QueueResult<EnqueueOutcome> {
        let queue = payload.queue();
        let mut state = self.state.lock().await;
        if state
            .jobs
            .values()
            .any(|job| job.queue == queue && job.task_id == task_id)
        {
            return Ok(EnqueueOutcome::Duplicate);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(
            id,
            LocalJob {
                queue,
                task_id: task_id.to_string(),
                payload,
                state: JobState::Ready,
                attempts: 0,
                available_at: Utc::now(),
                lease_token: None,
                leased_until: None,
                last_error: None,
            },
        );
        drop(state);
        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn try_dequeue(&self, queue: StageQueue) -> QueueResult<Option<Job>> {
        Ok(self.claim(queue, Utc::now()).await)
    }

    async fn dequeue(&self, queue: StageQueue) -> QueueResult<Job> {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.claim(queue, Utc::now()).await {
                return Ok(job);
            }
            // Delayed retries and lapsed leases never notify, so keep polling.
            let _ = tokio::time::timeout(self.settings.poll_interval, notified).await;
        }
    }

    async fn ack(&self, job: &Job) -> QueueResult<()> {
        self.settle(job, JobState::Done, None, None).await
    }

    async fn nack(
        &self,
        job: &Job,
        retry_in: Option<StdDuration>,
        reason: &str,
    ) -> QueueResult<()> {
        match retry_in {
            Some(delay) => {
                let at = Utc::now() + chrono_delay(delay);
                self.settle(job, JobState::Ready, Some(at), Some(reason))
                    .await?;
                self.notify.notify_waiters();
                Ok(())
            }
            None => self.settle(job, JobState::Dead, None, Some(reason)).await,
        }
    }

    async fn purge_task(&self, task_id: &str) -> QueueResult<usize> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| job.task_id != task_id);
        Ok(before - state.jobs.len())
    }

    async fn counts(&self) -> QueueResult<Vec<QueueCount>> {
        let state = self.state.lock().await;
        let mut counts: HashMap<(StageQueue, JobState), usize> = HashMap::new();
        for job in state.jobs.values() {
            *counts.entry((job.queue, job.state)).or_default() += 1;
        }
        let mut counts: Vec<QueueCount> = counts
            .into_iter()
            .map(|((queue, state), count)| QueueCount {
                queue,
                state,
                count,
            })
            .collect();
        counts.sort_by_key(|entry| (entry.queue, entry.state));
        Ok(counts)
    }
}

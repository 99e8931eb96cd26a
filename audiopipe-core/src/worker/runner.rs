use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{RetryPolicy, StageHandler, StageOutcome, WorkerError};
use crate::queue::{Job, JobDispatcher, QueueError, QueueResult, StageQueue};

/// What happened to a single claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    Acked(StageOutcome),
    Retrying { attempt: u32, delay: Duration },
    DeadLettered { reason: String },
}

/// Claims jobs from one stage queue and feeds them to its handler, one at a time.
#[derive(Clone)]
pub struct StageRunner {
    handler: Arc<dyn StageHandler>,
    dispatcher: Arc<dyn JobDispatcher>,
    retry: RetryPolicy,
    stage_timeout: Duration,
}

impl StageRunner {
    pub fn new(
        handler: Arc<dyn StageHandler>,
        dispatcher: Arc<dyn JobDispatcher>,
        retry: RetryPolicy,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            handler,
            dispatcher,
            retry,
            stage_timeout,
        }
    }

    pub fn stage(&self) -> StageQueue {
        self.handler.stage()
    }

    /// Processes at most one available job. Returns `None` when the queue had
    /// nothing ready.
    pub async fn run_once(&self) -> QueueResult<Option<JobDisposition>> {
        match self.dispatcher.try_dequeue(self.stage()).await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Claims and processes jobs until `shutdown` flips to `true`. A job in
    /// progress is finished before the runner stops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let stage = self.stage();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let job = tokio::select! {
                claimed = self.dispatcher.dequeue(stage) => claimed,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            match job {
                Ok(job) => {
                    if let Err(err) = self.process(job).await {
                        warn!(%stage, error = %err, "could not settle job");
                    }
                }
                Err(err) => {
                    warn!(%stage, error = %err, "dequeue failed, backing off");
                    tokio::time::sleep(self.dispatcher.poll_interval()).await;
                }
            }
        }
        debug!(%stage, "stage runner stopped");
    }

    async fn process(&self, job: Job) -> QueueResult<JobDisposition> {
        let stage = self.stage();
        debug!(%stage, task_id = %job.task_id, job_id = job.id, attempt = job.attempts, "job claimed");
        // Only lapsed leases push attempts past the budget.
        if self.retry.is_exhausted(job.attempts) {
            let reason = format!(
                "retries exhausted: claimed {} times without settling",
                job.attempts
            );
            return self.dead_letter(&job, reason).await;
        }
        let result = match timeout(self.stage_timeout, self.handler.handle(&job)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout {
                stage,
                after: self.stage_timeout,
            }),
        };

        match result {
            Ok(outcome) => {
                if let StageOutcome::Skipped(reason) = &outcome {
                    info!(%stage, task_id = %job.task_id, reason = %reason, "job skipped");
                }
                settle(self.dispatcher.ack(&job).await, &job)?;
                Ok(JobDisposition::Acked(outcome))
            }
            Err(err) if !err.is_fatal() && self.retry.should_retry(job.attempts) => {
                let delay = self.retry.compute_delay(job.attempts);
                warn!(
                    %stage,
                    task_id = %job.task_id,
                    attempt = job.attempts,
                    wait = ?delay,
                    error = %err,
                    "stage failed, retrying"
                );
                settle(
                    self.dispatcher
                        .nack(&job, Some(delay), &err.to_string())
                        .await,
                    &job,
                )?;
                Ok(JobDisposition::Retrying {
                    attempt: job.attempts,
                    delay,
                })
            }
            Err(err) => self.dead_letter(&job, err.to_string()).await,
        }
    }

    /// Fails the task and buries the job; it will not be delivered again.
    async fn dead_letter(&self, job: &Job, reason: String) -> QueueResult<JobDisposition> {
        let stage = self.stage();
        error!(
            %stage,
            task_id = %job.task_id,
            attempt = job.attempts,
            error = %reason,
            "stage failed permanently"
        );
        if let Err(fail_err) = self.handler.fail(job, &reason).await {
            warn!(%stage, task_id = %job.task_id, error = %fail_err, "failure bookkeeping incomplete");
        }
        settle(self.dispatcher.nack(job, None, &reason).await, job)?;
        Ok(JobDisposition::DeadLettered { reason })
    }
}

/// A lost lease means another worker owns the job now; that is not our error.
fn settle(result: QueueResult<()>, job: &Job) -> QueueResult<()> {
    match result {
        Err(QueueError::LeaseLost { job_id }) => {
            warn!(job_id, task_id = %job.task_id, "lease lost before settling job");
            Ok(())
        }
        other => other,
    }
}

/// A set of stage runners sharing one shutdown signal.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Starts `count` sequential copies of `runner`. The number of copies is the
    /// stage's concurrency limit.
    pub fn spawn(&mut self, runner: StageRunner, count: usize) {
        let stage = runner.stage();
        for index in 0..count.max(1) {
            let runner = runner.clone();
            let shutdown = self.shutdown.subscribe();
            debug!(%stage, index, "spawning stage runner");
            self.handles
                .push(tokio::spawn(async move { runner.run(shutdown).await }));
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Asks every runner to stop after its current job.
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Signals every runner and waits for in-flight jobs to settle.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "stage runner panicked");
            }
        }
    }
}

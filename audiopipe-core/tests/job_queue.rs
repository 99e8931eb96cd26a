use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use audiopipe_core::{
    connect_dispatcher, DispatcherBackend, EnqueueOutcome, JobDispatcher, JobPayload, JobState,
    LocalJobQueue, PipelineConfig, QueueError, QueueSettings, SqliteJobQueue, StageQueue,
};

fn temp_queue(dir: &Path) -> SqliteJobQueue {
    let queue = SqliteJobQueue::builder()
        .path(dir.join("queue.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create queue");
    queue.initialize().expect("initialize queue");
    queue
}

fn fetch(reference: &str) -> JobPayload {
    JobPayload::Fetch {
        source_reference: reference.into(),
    }
}

fn transcode(path: &str) -> JobPayload {
    JobPayload::Transcode {
        intermediate_path: PathBuf::from(path),
        duration_seconds: Some(180),
    }
}

#[test]
fn claims_in_order_and_dedupes_per_task() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    let now = Utc::now();

    let first = queue.enqueue_at("task-a", &fetch("ref-a"), now).unwrap();
    assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
    queue
        .enqueue_at("task-b", &fetch("ref-b"), now + Duration::seconds(1))
        .unwrap();
    assert_eq!(
        queue
            .enqueue_at("task-a", &fetch("ref-a"), now + Duration::seconds(2))
            .unwrap(),
        EnqueueOutcome::Duplicate
    );
    // A different stage for the same task is a separate job.
    assert!(matches!(
        queue
            .enqueue_at("task-a", &transcode("/tmp/a/source.webm"), now)
            .unwrap(),
        EnqueueOutcome::Enqueued(_)
    ));

    let later = now + Duration::seconds(5);
    let job = queue.claim_at(StageQueue::Fetch, later).unwrap().unwrap();
    assert_eq!(job.task_id, "task-a");
    assert_eq!(job.attempts, 1);
    assert_eq!(job.payload, fetch("ref-a"));
    let job_b = queue.claim_at(StageQueue::Fetch, later).unwrap().unwrap();
    assert_eq!(job_b.task_id, "task-b");
    assert!(queue.claim_at(StageQueue::Fetch, later).unwrap().is_none());

    queue.ack_at(&job, later).unwrap();
    assert_eq!(
        queue.job_state(StageQueue::Fetch, "task-a").unwrap(),
        Some(JobState::Done)
    );
    assert_eq!(
        queue.job_state(StageQueue::Fetch, "task-b").unwrap(),
        Some(JobState::InFlight)
    );
}

#[test]
fn lapsed_lease_is_reclaimed_and_old_owner_loses_it() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    let now = Utc::now();
    queue.enqueue_at("task-a", &fetch("ref-a"), now).unwrap();

    let first = queue.claim_at(StageQueue::Fetch, now).unwrap().unwrap();
    assert!(queue
        .claim_at(StageQueue::Fetch, now + Duration::seconds(30))
        .unwrap()
        .is_none());

    let after_lease = first.leased_until + Duration::seconds(1);
    let second = queue
        .claim_at(StageQueue::Fetch, after_lease)
        .unwrap()
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempts, 2);
    assert_ne!(second.lease_token, first.lease_token);

    let err = queue.ack_at(&first, after_lease).unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost { job_id } if job_id == first.id));
    queue.ack_at(&second, after_lease).unwrap();
}

#[test]
fn nack_delays_or_dead_letters() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    let now = Utc::now();
    queue.enqueue_at("task-a", &fetch("ref-a"), now).unwrap();

    let job = queue.claim_at(StageQueue::Fetch, now).unwrap().unwrap();
    queue
        .nack_at(&job, Some(StdDuration::from_secs(10)), "network blip", now)
        .unwrap();
    assert!(queue
        .claim_at(StageQueue::Fetch, now + Duration::seconds(5))
        .unwrap()
        .is_none());
    assert_eq!(
        queue.last_error(StageQueue::Fetch, "task-a").unwrap().as_deref(),
        Some("network blip")
    );

    let retry = queue
        .claim_at(StageQueue::Fetch, now + Duration::seconds(10))
        .unwrap()
        .unwrap();
    assert_eq!(retry.attempts, 2);
    queue
        .nack_at(&retry, None, "gave up", now + Duration::seconds(11))
        .unwrap();
    assert_eq!(
        queue.job_state(StageQueue::Fetch, "task-a").unwrap(),
        Some(JobState::Dead)
    );
    assert!(queue
        .claim_at(StageQueue::Fetch, now + Duration::days(1))
        .unwrap()
        .is_none());
}

#[test]
fn undecodable_payload_is_dead_lettered() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    let conn = rusqlite::Connection::open(dir.path().join("queue.sqlite")).unwrap();
    conn.execute(
        "INSERT INTO jobs (queue, task_id, payload, state, attempts, available_at, created_at, updated_at)
         VALUES ('fetch', 'task-x', '{\"kind\":\"bogus\"}', 'ready', 0, ?1, ?1, ?1)",
        [Utc::now().naive_utc()],
    )
    .unwrap();

    let err = queue
        .claim_at(StageQueue::Fetch, Utc::now() + Duration::seconds(1))
        .unwrap_err();
    assert!(matches!(err, QueueError::Payload(_)));
    assert_eq!(
        queue.job_state(StageQueue::Fetch, "task-x").unwrap(),
        Some(JobState::Dead)
    );
}

#[tokio::test]
async fn purge_and_counts_cover_every_stage() {
    let dir = TempDir::new().unwrap();
    let queue = temp_queue(dir.path());
    queue.enqueue("task-a", fetch("ref-a")).await.unwrap();
    queue
        .enqueue("task-a", transcode("/tmp/a/source.webm"))
        .await
        .unwrap();
    queue.enqueue("task-b", fetch("ref-b")).await.unwrap();

    let counts = queue.counts().await.unwrap();
    let ready: usize = counts
        .iter()
        .filter(|entry| entry.state == JobState::Ready)
        .map(|entry| entry.count)
        .sum();
    assert_eq!(ready, 3);

    assert_eq!(queue.purge_task("task-a").await.unwrap(), 2);
    let job = queue.try_dequeue(StageQueue::Fetch).await.unwrap().unwrap();
    assert_eq!(job.task_id, "task-b");
    assert!(queue
        .try_dequeue(StageQueue::Transcode)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn local_queue_shares_lease_and_dedupe_rules() {
    let settings = QueueSettings {
        fetch_visibility: Duration::zero(),
        ..QueueSettings::default()
    };
    let queue = LocalJobQueue::new(settings);
    assert_eq!(queue.backend(), DispatcherBackend::Local);

    assert!(matches!(
        queue.enqueue("task-a", fetch("ref-a")).await.unwrap(),
        EnqueueOutcome::Enqueued(_)
    ));
    assert_eq!(
        queue.enqueue("task-a", fetch("ref-a")).await.unwrap(),
        EnqueueOutcome::Duplicate
    );

    // Zero visibility: the lease lapses as soon as it is granted.
    let first = queue.try_dequeue(StageQueue::Fetch).await.unwrap().unwrap();
    let second = queue.try_dequeue(StageQueue::Fetch).await.unwrap().unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.attempts, 2);
    assert!(matches!(
        queue.ack(&first).await,
        Err(QueueError::LeaseLost { .. })
    ));

    queue
        .nack(&second, Some(StdDuration::from_secs(3600)), "network blip")
        .await
        .unwrap();
    assert!(queue
        .try_dequeue(StageQueue::Fetch)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        queue.last_error(StageQueue::Fetch, "task-a").await.as_deref(),
        Some("network blip")
    );
    assert_eq!(
        queue.job_state(StageQueue::Fetch, "task-a").await,
        Some(JobState::Ready)
    );
}

#[tokio::test]
async fn local_dequeue_wakes_on_enqueue() {
    let queue = std::sync::Arc::new(LocalJobQueue::default());
    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.dequeue(StageQueue::Cleanup).await })
    };
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    queue
        .enqueue(
            "task-a",
            JobPayload::Cleanup {
                intermediate_path: PathBuf::from("/tmp/a/source.webm"),
            },
        )
        .await
        .unwrap();
    let job = tokio::time::timeout(StdDuration::from_secs(5), waiter)
        .await
        .expect("dequeue woke up")
        .unwrap()
        .unwrap();
    assert_eq!(job.task_id, "task-a");
}

#[test]
fn unreachable_durable_queue_falls_back_unless_required() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let mut config = PipelineConfig::default();
    config.queue.queue_db = blocker.join("queue.sqlite");
    let dispatcher = connect_dispatcher(&config).unwrap();
    assert_eq!(dispatcher.backend(), DispatcherBackend::Local);

    config.queue.require_durable = true;
    let err = connect_dispatcher(&config).err().unwrap();
    assert!(matches!(err, QueueError::ServiceUnavailable(_)));

    config.queue.queue_db = dir.path().join("queue.sqlite");
    let dispatcher = connect_dispatcher(&config).unwrap();
    assert_eq!(dispatcher.backend(), DispatcherBackend::Durable);
}

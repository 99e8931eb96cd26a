use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use crate::capability::{ProgressControl, ProgressSink};
use crate::task::{SqliteTaskStore, TaskError, TaskPatch, TaskStage};

const CANCEL_CHECK_MS: u64 = 1_000;

/// Maps a tool's 0..=100 progress onto the task's band for one stage and
/// relays cancellation requests back to the tool.
pub struct TaskProgress {
    store: SqliteTaskStore,
    task_id: String,
    stage: TaskStage,
    low: u8,
    high: u8,
    label: &'static str,
    last: AtomicU8,
    started: Instant,
    last_check_ms: AtomicU64,
}

impl TaskProgress {
    pub fn new(
        store: SqliteTaskStore,
        task_id: impl Into<String>,
        stage: TaskStage,
        band: (u8, u8),
        label: &'static str,
    ) -> Self {
        Self {
            store,
            task_id: task_id.into(),
            stage,
            low: band.0,
            high: band.1.max(band.0),
            label,
            last: AtomicU8::new(band.0),
            started: Instant::now(),
            last_check_ms: AtomicU64::new(0),
        }
    }

    pub fn scale(&self, percent: f64) -> u8 {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let span = f64::from(self.high - self.low);
        self.low + (span * percent / 100.0).floor() as u8
    }
}

#[async_trait]
impl ProgressSink for TaskProgress {
    async fn report(&self, percent: f64) -> ProgressControl {
        let scaled = self.scale(percent);
        let previous = self.last.fetch_max(scaled, Ordering::SeqCst);
        let elapsed = self.started.elapsed().as_millis() as u64;
        let check_due =
            elapsed.saturating_sub(self.last_check_ms.load(Ordering::Relaxed)) >= CANCEL_CHECK_MS;
        if scaled <= previous && !check_due {
            return ProgressControl::Continue;
        }
        self.last_check_ms.store(elapsed, Ordering::Relaxed);

        if scaled <= previous {
            return match self.store.is_cancel_requested_async(&self.task_id).await {
                Ok(true) => ProgressControl::Cancel,
                _ => ProgressControl::Continue,
            };
        }

        let patch = TaskPatch::new()
            .progress(scaled)
            .message(format!("{}: {}%", self.label, percent.clamp(0.0, 100.0).round()));
        match self
            .store
            .transition_async(&self.task_id, &[self.stage], &patch)
            .await
        {
            Ok(task) if task.cancel_requested => ProgressControl::Cancel,
            Ok(_) => ProgressControl::Continue,
            Err(TaskError::StageConflict { .. }) | Err(TaskError::NotFound { .. }) => {
                ProgressControl::Cancel
            }
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "progress update failed");
                ProgressControl::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NewTask;
    use tempfile::tempdir;

    #[tokio::test]
    async fn rescales_into_band_and_sees_cancellation() {
        let dir = tempdir().unwrap();
        let store = SqliteTaskStore::new(dir.path().join("tasks.sqlite")).unwrap();
        store.initialize().unwrap();
        let task = store.create(&NewTask::new("ref")).unwrap();
        store
            .update(&task.id, &TaskPatch::new().stage(TaskStage::Fetching))
            .unwrap();

        let sink = TaskProgress::new(
            store.clone(),
            &task.id,
            TaskStage::Fetching,
            (0, 50),
            "Downloading",
        );
        assert_eq!(sink.scale(0.0), 0);
        assert_eq!(sink.scale(50.0), 25);
        assert_eq!(sink.scale(100.0), 50);
        assert_eq!(sink.scale(f64::NAN), 0);

        assert_eq!(sink.report(40.0).await, ProgressControl::Continue);
        let current = store.get(&task.id).unwrap();
        assert_eq!(current.progress, 20);
        assert_eq!(current.message, "Downloading: 40%");

        // lower values never move the record backwards
        assert_eq!(sink.report(10.0).await, ProgressControl::Continue);
        assert_eq!(store.get(&task.id).unwrap().progress, 20);

        store.request_cancel(&task.id).unwrap();
        assert_eq!(sink.report(60.0).await, ProgressControl::Cancel);
    }
}

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{LifecycleError, LifecycleResult};
use crate::config::PipelineConfig;
use crate::queue::JobDispatcher;
use crate::task::{SqliteTaskStore, Task};
use crate::worker::ArtifactPaths;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub tasks_evicted: usize,
    pub artifacts_removed: usize,
    pub bytes_freed: u64,
    pub stale_temp_entries_removed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Timer-driven eviction of expired tasks plus a backstop for temp-area
/// leftovers that no cleanup job will ever reach.
pub struct ExpirySweeper {
    store: SqliteTaskStore,
    dispatcher: Arc<dyn JobDispatcher>,
    temp_dir: PathBuf,
    storage_dir: PathBuf,
    interval: StdDuration,
    temp_max_age: Duration,
}

impl ExpirySweeper {
    pub fn new(
        store: SqliteTaskStore,
        dispatcher: Arc<dyn JobDispatcher>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            temp_dir: config.paths.temp_dir.clone(),
            storage_dir: config.paths.storage_dir.clone(),
            interval: config.sweep_interval(),
            temp_max_age: config.temp_max_age(),
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> LifecycleResult<SweepReport> {
        let mut report = SweepReport::default();
        for task in self.store.list_expired(now)? {
            match self.evict(&task, &mut report).await {
                Ok(()) => report.tasks_evicted += 1,
                Err(err) => warn!(task_id = %task.id, error = %err, "eviction failed, will retry"),
            }
        }
        report.stale_temp_entries_removed = self.sweep_temp(now).await?;
        if !report.is_empty() {
            info!(
                evicted = report.tasks_evicted,
                artifacts = report.artifacts_removed,
                bytes = report.bytes_freed,
                temp_entries = report.stale_temp_entries_removed,
                "expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Artifact first, then jobs, then the record, so a failure part-way
    /// leaves the task listed for the next sweep.
    async fn evict(&self, task: &Task, report: &mut SweepReport) -> LifecycleResult<()> {
        if let Some(artifact) = &task.artifact {
            if let Some(bytes) = remove_file_if_present(&artifact.path).await? {
                report.artifacts_removed += 1;
                report.bytes_freed += bytes;
            }
        }
        if !task.stage.terminal() {
            // Abandoned mid-pipeline; a transcode may have left output behind.
            let paths = ArtifactPaths::new(&self.temp_dir, &self.storage_dir);
            remove_file_if_present(&paths.partial_output(&task.id)).await?;
            if let Some(bytes) = remove_file_if_present(&paths.output(&task.id)).await? {
                report.artifacts_removed += 1;
                report.bytes_freed += bytes;
            }
        }
        remove_dir_if_present(&self.temp_dir.join(&task.id)).await?;
        self.dispatcher.purge_task(&task.id).await?;
        self.store.delete(&task.id)?;
        debug!(task_id = %task.id, stage = %task.stage, "task evicted");
        Ok(())
    }

    async fn sweep_temp(&self, now: DateTime<Utc>) -> LifecycleResult<usize> {
        let mut entries = match fs::read_dir(&self.temp_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(LifecycleError::Io {
                    path: self.temp_dir.clone(),
                    source,
                })
            }
        };
        let active = self.store.active_ids()?;
        let cutoff = now - self.temp_max_age;
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(LifecycleError::Io {
                        path: self.temp_dir.clone(),
                        source,
                    })
                }
            };
            let path = entry.path();
            if path == self.storage_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if active.contains(&name) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let modified = newest_modification(&path)
                .map(DateTime::<Utc>::from)
                .unwrap_or(now);
            if modified > cutoff {
                continue;
            }
            let result = if metadata.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "could not remove stale temp entry"),
            }
        }
        Ok(removed)
    }

    /// Sweeps on every tick until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep(Utc::now()).await {
                        warn!(error = %err, "expiry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("expiry sweeper stopped");
    }
}

/// Latest modification anywhere under `path`. A directory stays fresh while
/// any file inside it is still being written.
fn newest_modification(path: &Path) -> Option<SystemTime> {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .max()
}

/// Returns the size of the removed file, or `None` when it was already gone.
pub(crate) async fn remove_file_if_present(path: &Path) -> LifecycleResult<Option<u64>> {
    let size = match fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LifecycleError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match fs::remove_file(path).await {
        Ok(()) => Ok(Some(size)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LifecycleError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Returns whether anything was removed.
pub(crate) async fn remove_dir_if_present(path: &Path) -> LifecycleResult<bool> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(LifecycleError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

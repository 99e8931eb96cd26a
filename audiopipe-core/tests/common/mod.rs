#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use audiopipe_core::{
    AudioPipeline, CapabilityError, FetchOutput, JobDispatcher, LocalJobQueue, MediaFetcher,
    MediaMetadata, MediaTranscoder, PipelineConfig, ProgressControl, ProgressSink, QueueSettings,
    SqliteTaskStore, TaskStage,
};

/// Fetcher whose behaviour is chosen by the source reference:
///
/// * `ref-ok-*` downloads a small file and reports a three minute track
/// * `ref-too-long` violates the duration policy
/// * `ref-no-media` finds nothing to download
/// * `ref-flaky-N` fails transiently N times, then succeeds
/// * `ref-down` always fails transiently
/// * `ref-slow-*` sleeps while holding a concurrency slot
/// * `ref-cancel` reports progress until told to stop
#[derive(Default)]
pub struct ScriptedFetcher {
    attempts: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
    slow_for: Mutex<Option<Duration>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slow_delay(delay: Duration) -> Self {
        let fetcher = Self::default();
        *fetcher.slow_for.lock().unwrap() = Some(delay);
        fetcher
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn attempts_for(&self, reference: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(reference)
            .copied()
            .unwrap_or(0)
    }

    async fn download(
        &self,
        reference: &str,
        work_dir: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<FetchOutput, CapabilityError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(reference.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if reference == "ref-too-long" {
            return Err(CapabilityError::Policy(
                "media is 45:00 long, the limit is 10:00".into(),
            ));
        }
        if reference == "ref-no-media" {
            return Err(CapabilityError::NoMedia("no audio streams".into()));
        }
        if reference == "ref-down" {
            return Err(CapabilityError::Transient("connection reset".into()));
        }
        if let Some(count) = reference.strip_prefix("ref-flaky-") {
            let failures: usize = count.parse().unwrap_or(1);
            if attempt <= failures {
                return Err(CapabilityError::Transient(format!(
                    "network blip on attempt {attempt}"
                )));
            }
        }
        if reference.starts_with("ref-slow") {
            let delay = self
                .slow_for
                .lock()
                .unwrap()
                .unwrap_or(Duration::from_millis(50));
            tokio::time::sleep(delay).await;
        }
        if reference == "ref-cancel" {
            for step in 0..500u32 {
                if progress.report(f64::from(step % 100)).await == ProgressControl::Cancel {
                    return Err(CapabilityError::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            return Err(CapabilityError::Transient("never cancelled".into()));
        }

        for percent in [10.0, 55.0, 100.0] {
            if progress.report(percent).await == ProgressControl::Cancel {
                return Err(CapabilityError::Cancelled);
            }
        }
        let path = work_dir.join("source.webm");
        tokio::fs::write(&path, vec![7u8; 4096])
            .await
            .map_err(|source| CapabilityError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(FetchOutput {
            path,
            metadata: MediaMetadata {
                title: Some(format!("Track {reference}")),
                channel: Some("Test Channel".into()),
                thumbnail: None,
                duration_seconds: Some(180),
            },
        })
    }
}

#[async_trait]
impl MediaFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        source_reference: &str,
        work_dir: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<FetchOutput, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let result = self.download(source_reference, work_dir, progress).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TranscodeMode {
    #[default]
    Copy,
    Unsupported,
    Empty,
}

/// Transcoder that copies its input, or fails the way `mode` says.
#[derive(Default)]
pub struct ScriptedTranscoder {
    mode: Mutex<TranscodeMode>,
    calls: AtomicUsize,
}

impl ScriptedTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&self, mode: TranscodeMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTranscoder for ScriptedTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        _duration_seconds: Option<u64>,
        progress: &dyn ProgressSink,
    ) -> Result<(), CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            TranscodeMode::Unsupported => {
                return Err(CapabilityError::Unsupported("unknown codec".into()))
            }
            TranscodeMode::Empty => {
                tokio::fs::write(output, b"")
                    .await
                    .map_err(|source| CapabilityError::Io {
                        path: output.to_path_buf(),
                        source,
                    })?;
                return Ok(());
            }
            TranscodeMode::Copy => {}
        }
        for percent in [25.0, 50.0, 100.0] {
            if progress.report(percent).await == ProgressControl::Cancel {
                return Err(CapabilityError::Cancelled);
            }
        }
        tokio::fs::copy(input, output)
            .await
            .map_err(|source| CapabilityError::Io {
                path: output.to_path_buf(),
                source,
            })?;
        Ok(())
    }
}

pub fn test_config(base: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.store.task_db = base.join("data").join("tasks.sqlite");
    config.queue.queue_db = base.join("data").join("queue.sqlite");
    config.queue.poll_interval_ms = 10;
    config.paths.temp_dir = base.join("temp");
    config.paths.storage_dir = base.join("temp").join("output");
    config.limits.max_concurrent_downloads = 2;
    config.limits.max_concurrent_transcodes = 1;
    config.timeouts.fetch_seconds = 30;
    config.timeouts.transcode_seconds = 30;
    config.retry.max_attempts = 3;
    config.retry.base_delay_seconds = 0;
    config.retry.max_delay_seconds = 0;
    config.retention.artifact_ttl_hours = 1;
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub pipeline: AudioPipeline,
    pub fetcher: Arc<ScriptedFetcher>,
    pub transcoder: Arc<ScriptedTranscoder>,
}

impl Harness {
    pub fn fetcher(&self) -> Arc<dyn MediaFetcher> {
        self.fetcher.clone()
    }

    pub fn transcoder(&self) -> Arc<dyn MediaTranscoder> {
        self.transcoder.clone()
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.pipeline.config().paths.temp_dir.clone()
    }

    pub async fn drain(&self) -> audiopipe_core::DrainReport {
        self.pipeline
            .drain(self.fetcher(), self.transcoder())
            .await
            .unwrap()
    }

    /// Polls the store until the task reaches `stage` or the deadline passes.
    pub async fn wait_for_stage(&self, task_id: &str, stage: TaskStage) -> bool {
        for _ in 0..500 {
            if self.pipeline.store().get(task_id).unwrap().stage == stage {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

/// Pipeline on the durable SQLite queue.
pub async fn harness() -> Harness {
    harness_with(ScriptedFetcher::new(), |_| {}).await
}

pub async fn harness_with(
    fetcher: ScriptedFetcher,
    adjust: impl FnOnce(&mut PipelineConfig),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    adjust(&mut config);
    let pipeline = AudioPipeline::connect(config).await.unwrap();
    Harness {
        dir,
        pipeline,
        fetcher: Arc::new(fetcher),
        transcoder: Arc::new(ScriptedTranscoder::new()),
    }
}

/// Pipeline on the in-process fallback queue.
pub async fn local_harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = SqliteTaskStore::builder()
        .path(&config.store.task_db)
        .ttl(config.artifact_ttl())
        .build()
        .unwrap();
    store.initialize().unwrap();
    let dispatcher: Arc<dyn JobDispatcher> =
        Arc::new(LocalJobQueue::new(QueueSettings::from_config(&config)));
    let pipeline = AudioPipeline::from_parts(config, store, dispatcher)
        .await
        .unwrap();
    Harness {
        dir,
        pipeline,
        fetcher: Arc::new(ScriptedFetcher::new()),
        transcoder: Arc::new(ScriptedTranscoder::new()),
    }
}

//! External media tools behind async traits. Workers only see these traits;
//! the concrete adapters shell out to `yt-dlp` and `ffmpeg`.

pub mod ffmpeg;
pub mod ytdlp;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

pub use ffmpeg::FfmpegTranscoder;
pub use ytdlp::YtDlpFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressControl {
    Continue,
    Cancel,
}

/// Receives progress in the tool's own 0..=100 scale.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, percent: f64) -> ProgressControl;
}

/// Sink that ignores progress and never cancels.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _percent: f64) -> ProgressControl {
        ProgressControl::Continue
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub channel: Option<String>,
    pub thumbnail: Option<String>,
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutput {
    pub path: PathBuf,
    pub metadata: MediaMetadata,
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("no usable media: {0}")]
    NoMedia(String),
    #[error("{0}")]
    Policy(String),
    #[error("unsupported input: {0}")]
    Unsupported(String),
    #[error("tool not found: {0}")]
    ToolMissing(PathBuf),
    #[error("cancelled")]
    Cancelled,
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl CapabilityError {
    /// Fatal errors end the task; the rest are worth another attempt.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CapabilityError::Transient(_) | CapabilityError::Io { .. })
    }
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Downloads `source_reference` into `work_dir` and returns the file written.
    async fn fetch(
        &self,
        source_reference: &str,
        work_dir: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<FetchOutput, CapabilityError>;
}

#[async_trait]
pub trait MediaTranscoder: Send + Sync {
    /// Converts `input` into audio at `output`, overwriting whatever is there.
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        duration_seconds: Option<u64>,
        progress: &dyn ProgressSink,
    ) -> Result<(), CapabilityError>;
}

pub(crate) struct ProcessOutcome {
    pub success: bool,
    pub code: Option<i32>,
    pub stderr: String,
}

pub(crate) fn spawn_error(program: &Path, err: std::io::Error) -> CapabilityError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CapabilityError::ToolMissing(program.to_path_buf())
    } else {
        CapabilityError::Io {
            path: program.to_path_buf(),
            source: err,
        }
    }
}

/// Runs `command`, feeding each stdout line through `parse` and forwarding any
/// percentage to `progress`. The child is killed when the sink cancels or the
/// returned future is dropped.
pub(crate) async fn drive_process<F>(
    mut command: Command,
    program: &Path,
    parse: F,
    progress: &dyn ProgressSink,
) -> Result<ProcessOutcome, CapabilityError>
where
    F: Fn(&str) -> Option<f64> + Send + Sync,
{
    command
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn().map_err(|err| spawn_error(program, err))?;
    let io_error = |source| CapabilityError::Io {
        path: program.to_path_buf(),
        source,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CapabilityError::Transient("child stdout not captured".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| CapabilityError::Transient("child stderr not captured".into()))?;
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await.map_err(io_error)? {
        if let Some(percent) = parse(&line) {
            if progress.report(percent).await == ProgressControl::Cancel {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(CapabilityError::Cancelled);
            }
        }
    }

    let status = child.wait().await.map_err(io_error)?;
    let stderr = stderr_task.await.unwrap_or_default();
    Ok(ProcessOutcome {
        success: status.success(),
        code: status.code(),
        stderr,
    })
}

/// Last non-empty line of a tool's stderr, for error messages.
pub(crate) fn last_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no diagnostic output")
        .to_string()
}

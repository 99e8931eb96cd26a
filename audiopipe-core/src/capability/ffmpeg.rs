use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{
    drive_process, last_line, CapabilityError, MediaTranscoder, ProgressControl, ProgressSink,
};
use crate::config::ToolsSection;

/// Converts to MP3 with `ffmpeg`, reading `-progress pipe:1` key/value lines.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
    duration_tool: PathBuf,
    bitrate: String,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>, bitrate: impl Into<String>) -> Self {
        let binary = binary.into();
        let duration_tool = sibling_duration_tool(&binary);
        Self {
            binary,
            duration_tool,
            bitrate: bitrate.into(),
        }
    }

    pub fn from_config(tools: &ToolsSection) -> Self {
        Self::new(tools.transcoder.clone(), tools.audio_bitrate.clone())
    }

    async fn read_duration(&self, input: &Path) -> Option<u64> {
        let mut command = Command::new(&self.duration_tool);
        command
            .kill_on_drop(true)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(input);
        match timeout(Duration::from_secs(30), command.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                text.trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite() && *value > 0.0)
                    .map(|value| value.ceil() as u64)
            }
            Ok(Ok(output)) => {
                warn!(
                    stderr = %last_line(&String::from_utf8_lossy(&output.stderr)),
                    "could not determine input duration"
                );
                None
            }
            _ => None,
        }
    }
}

#[async_trait]
impl MediaTranscoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        duration_seconds: Option<u64>,
        progress: &dyn ProgressSink,
    ) -> Result<(), CapabilityError> {
        let duration = match duration_seconds {
            Some(duration) if duration > 0 => Some(duration),
            _ => self.read_duration(input).await,
        };
        let total_us = duration.map(|seconds| seconds.saturating_mul(1_000_000));
        if total_us.is_none() && progress.report(50.0).await == ProgressControl::Cancel {
            return Err(CapabilityError::Cancelled);
        }

        let mut command = Command::new(&self.binary);
        command
            .arg("-y")
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-codec:a")
            .arg("libmp3lame")
            .arg("-b:a")
            .arg(&self.bitrate)
            .arg("-f")
            .arg("mp3")
            .arg("-progress")
            .arg("pipe:1")
            .arg(output);

        let parser = ProgressParser::new(total_us);
        let outcome =
            drive_process(command, &self.binary, |line| parser.feed(line), progress).await?;
        if !outcome.success {
            debug!(code = ?outcome.code, "transcoder exited unsuccessfully");
            return Err(classify_failure(&outcome.stderr));
        }
        Ok(())
    }
}

/// Tracks `out_time_us` lines against a known total.
struct ProgressParser {
    total_us: Option<u64>,
}

impl ProgressParser {
    fn new(total_us: Option<u64>) -> Self {
        Self { total_us }
    }

    fn feed(&self, line: &str) -> Option<f64> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // `out_time_ms` is reported in microseconds despite its name.
            "out_time_us" | "out_time_ms" => {
                let micros = value.trim().parse::<u64>().ok()?;
                let total = self.total_us.filter(|total| *total > 0)?;
                Some((micros as f64 / total as f64 * 100.0).min(100.0))
            }
            "progress" if value.trim() == "end" => Some(100.0),
            _ => None,
        }
    }
}

fn classify_failure(stderr: &str) -> CapabilityError {
    let lowered = stderr.to_lowercase();
    let detail = last_line(stderr);
    if lowered.contains("invalid data found")
        || lowered.contains("does not contain any stream")
        || lowered.contains("output file #0 does not contain")
        || lowered.contains("unknown encoder")
    {
        CapabilityError::Unsupported(detail)
    } else if lowered.contains("no such file or directory") {
        CapabilityError::NoMedia(detail)
    } else {
        CapabilityError::Transient(detail)
    }
}

fn sibling_duration_tool(binary: &Path) -> PathBuf {
    match binary.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join("ffprobe"),
        _ => PathBuf::from("ffprobe"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_scale_against_duration() {
        let parser = ProgressParser::new(Some(200 * 1_000_000));
        assert_eq!(parser.feed("frame=0"), None);
        assert_eq!(parser.feed("out_time_us=50000000"), Some(25.0));
        assert_eq!(parser.feed("out_time_ms=100000000"), Some(50.0));
        assert_eq!(parser.feed("out_time_us=999000000"), Some(100.0));
        assert_eq!(parser.feed("progress=continue"), None);
        assert_eq!(parser.feed("progress=end"), Some(100.0));
    }

    #[test]
    fn unknown_duration_only_reports_completion() {
        let parser = ProgressParser::new(None);
        assert_eq!(parser.feed("out_time_us=50000000"), None);
        assert_eq!(parser.feed("progress=end"), Some(100.0));
    }

    #[test]
    fn failures_are_classified() {
        assert!(classify_failure("input.webm: Invalid data found when processing input").is_fatal());
        assert!(!classify_failure("Conversion failed!").is_fatal());
    }

    #[test]
    fn duration_tool_sits_next_to_ffmpeg() {
        assert_eq!(sibling_duration_tool(Path::new("ffmpeg")), PathBuf::from("ffprobe"));
        assert_eq!(
            sibling_duration_tool(Path::new("/opt/ff/bin/ffmpeg")),
            PathBuf::from("/opt/ff/bin/ffprobe")
        );
    }
}

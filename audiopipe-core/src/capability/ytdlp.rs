use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{
    drive_process, last_line, spawn_error, CapabilityError, FetchOutput, MediaFetcher,
    MediaMetadata, ProgressSink,
};
use crate::config::ToolsSection;

const MIN_MEDIA_BYTES: u64 = 1024;
const SOURCE_STEM: &str = "source";
const MARKUP_MARKERS: [&str; 9] = [
    "MIME-Version:",
    "Content-Type: multipart/related",
    "Content-Location:",
    "text/html",
    "<html",
    "<!doctype",
    "<head>",
    "<body>",
    "--boundary",
];

/// Fetches media with `yt-dlp`: a metadata query, a duration check, then the
/// download with `--newline` progress lines.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: PathBuf,
    max_duration_seconds: u64,
    metadata_timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<PathBuf>, max_duration_seconds: u64) -> Self {
        Self {
            binary: binary.into(),
            max_duration_seconds,
            metadata_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(tools: &ToolsSection) -> Self {
        Self::new(tools.downloader.clone(), tools.max_duration_seconds)
    }

    pub fn with_metadata_timeout(mut self, metadata_timeout: Duration) -> Self {
        self.metadata_timeout = metadata_timeout;
        self
    }

    async fn fetch_metadata(
        &self,
        source_reference: &str,
    ) -> Result<MediaMetadata, CapabilityError> {
        let mut command = Command::new(&self.binary);
        command
            .kill_on_drop(true)
            .arg("--dump-single-json")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg(source_reference);
        let output = match timeout(self.metadata_timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(spawn_error(&self.binary, err)),
            Err(_) => {
                return Err(CapabilityError::Transient(format!(
                    "metadata query timed out after {}s",
                    self.metadata_timeout.as_secs()
                )))
            }
        };
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        parse_metadata(&output.stdout)
    }

    fn check_duration(&self, metadata: &MediaMetadata) -> Result<(), CapabilityError> {
        match metadata.duration_seconds {
            Some(duration) if self.max_duration_seconds > 0 && duration > self.max_duration_seconds => {
                Err(CapabilityError::Policy(format!(
                    "media is {} long, the limit is {}",
                    minutes(duration),
                    minutes(self.max_duration_seconds)
                )))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        source_reference: &str,
        work_dir: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<FetchOutput, CapabilityError> {
        let metadata = self.fetch_metadata(source_reference).await?;
        self.check_duration(&metadata)?;
        debug!(
            source = source_reference,
            title = metadata.title.as_deref().unwrap_or(""),
            "metadata read"
        );

        let template = work_dir.join(format!("{SOURCE_STEM}.%(ext)s"));
        let mut command = Command::new(&self.binary);
        command
            .arg("--newline")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-part")
            .arg("--format")
            .arg("bestaudio[ext=webm]/bestaudio[ext=m4a]/bestaudio/best")
            .arg("--output")
            .arg(&template)
            .arg(source_reference);
        let outcome = drive_process(command, &self.binary, parse_download_progress, progress).await?;
        if !outcome.success {
            debug!(code = ?outcome.code, "downloader exited unsuccessfully");
            return Err(classify_failure(&outcome.stderr));
        }

        let path = locate_download(work_dir).await?;
        validate_download(&path).await?;
        Ok(FetchOutput { path, metadata })
    }
}

#[derive(Debug, Deserialize)]
struct MetadataDocument {
    title: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    #[serde(rename = "_type")]
    kind: Option<String>,
}

pub fn parse_metadata(stdout: &[u8]) -> Result<MediaMetadata, CapabilityError> {
    let document: MetadataDocument = serde_json::from_slice(stdout)
        .map_err(|err| CapabilityError::NoMedia(format!("unreadable metadata: {err}")))?;
    if document.kind.as_deref() == Some("playlist") {
        return Err(CapabilityError::Unsupported("playlists are not supported".into()));
    }
    Ok(MediaMetadata {
        title: document.title,
        channel: document.channel.or(document.uploader),
        thumbnail: document.thumbnail,
        duration_seconds: document
            .duration
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| value.round() as u64),
    })
}

/// `[download]  42.3% of ...` → `42.3`.
pub fn parse_download_progress(line: &str) -> Option<f64> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^\[download\]\s+(\d{1,3}(?:\.\d+)?)%").ok())
        .as_ref()?;
    let captures = pattern.captures(line.trim_start())?;
    captures
        .get(1)?
        .as_str()
        .parse::<f64>()
        .ok()
        .map(|value| value.clamp(0.0, 100.0))
}

pub fn classify_failure(stderr: &str) -> CapabilityError {
    let lowered = stderr.to_lowercase();
    let detail = last_line(stderr);
    if lowered.contains("unsupported url") {
        CapabilityError::Unsupported(detail)
    } else if lowered.contains("video unavailable")
        || lowered.contains("private video")
        || lowered.contains("has been removed")
        || lowered.contains("not available")
        || lowered.contains("no video formats")
        || lowered.contains("requested format is not available")
    {
        CapabilityError::NoMedia(detail)
    } else {
        CapabilityError::Transient(detail)
    }
}

pub fn looks_like_markup(head: &str) -> bool {
    let lowered = head.to_lowercase();
    MARKUP_MARKERS
        .iter()
        .any(|marker| lowered.contains(&marker.to_lowercase()))
}

async fn locate_download(work_dir: &Path) -> Result<PathBuf, CapabilityError> {
    let io_error = |source| CapabilityError::Io {
        path: work_dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(work_dir).await.map_err(io_error)?;
    let mut best: Option<(u64, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let path = entry.path();
        let is_source = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem == SOURCE_STEM);
        let is_partial = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "part" || ext == "ytdl");
        if !is_source || is_partial {
            continue;
        }
        let size = entry.metadata().await.map_err(io_error)?.len();
        if best.as_ref().map_or(true, |(current, _)| size > *current) {
            best = Some((size, path));
        }
    }
    best.map(|(_, path)| path)
        .ok_or_else(|| CapabilityError::NoMedia("downloader produced no file".into()))
}

async fn validate_download(path: &Path) -> Result<(), CapabilityError> {
    let io_error = |source| CapabilityError::Io {
        path: path.to_path_buf(),
        source,
    };
    let size = fs::metadata(path).await.map_err(io_error)?.len();
    if size < MIN_MEDIA_BYTES {
        return Err(CapabilityError::NoMedia(format!(
            "downloaded file is only {size} bytes"
        )));
    }
    let mut head = vec![0u8; 1024];
    let mut file = fs::File::open(path).await.map_err(io_error)?;
    let read = file.read(&mut head).await.map_err(io_error)?;
    head.truncate(read);
    if looks_like_markup(&String::from_utf8_lossy(&head)) {
        return Err(CapabilityError::NoMedia(
            "downloaded file is a web page, not media".into(),
        ));
    }
    Ok(())
}

fn minutes(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_download_lines() {
        assert_eq!(
            parse_download_progress("[download]  42.3% of 3.10MiB at 1.2MiB/s ETA 00:02"),
            Some(42.3)
        );
        assert_eq!(parse_download_progress("[download] 100% of 3.10MiB"), Some(100.0));
        assert_eq!(parse_download_progress("[download] Destination: source.webm"), None);
        assert_eq!(parse_download_progress("[youtube] abc: Downloading webpage"), None);
    }

    #[test]
    fn metadata_document_maps_to_media_metadata() {
        let json = br#"{"title":"Song","uploader":"Band","thumbnail":"https://i/x.jpg","duration":183.4}"#;
        let metadata = parse_metadata(json).unwrap();
        assert_eq!(metadata.title.as_deref(), Some("Song"));
        assert_eq!(metadata.channel.as_deref(), Some("Band"));
        assert_eq!(metadata.duration_seconds, Some(183));

        let err = parse_metadata(br#"{"_type":"playlist","title":"Mix"}"#).unwrap_err();
        assert!(matches!(err, CapabilityError::Unsupported(_)));
    }

    #[test]
    fn duration_limit_is_a_policy_error() {
        let fetcher = YtDlpFetcher::new("yt-dlp", 600);
        let long = MediaMetadata {
            duration_seconds: Some(601),
            ..MediaMetadata::default()
        };
        let err = fetcher.check_duration(&long).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("10:01"));

        let unknown = MediaMetadata::default();
        assert!(fetcher.check_duration(&unknown).is_ok());
    }

    #[test]
    fn stderr_is_classified() {
        assert!(matches!(
            classify_failure("ERROR: Unsupported URL: https://example.com"),
            CapabilityError::Unsupported(_)
        ));
        assert!(matches!(
            classify_failure("ERROR: [youtube] x: Private video"),
            CapabilityError::NoMedia(_)
        ));
        let transient = classify_failure("ERROR: unable to download webpage: timed out");
        assert!(!transient.is_fatal());
    }

    #[tokio::test]
    async fn rejects_tiny_and_markup_downloads() {
        let dir = tempdir().unwrap();
        let tiny = dir.path().join("source.webm");
        std::fs::write(&tiny, b"abc").unwrap();
        assert!(matches!(
            validate_download(&tiny).await,
            Err(CapabilityError::NoMedia(_))
        ));

        let mut page = b"<!DOCTYPE html><html><head>".to_vec();
        page.resize(4096, b' ');
        std::fs::write(&tiny, &page).unwrap();
        assert!(matches!(
            validate_download(&tiny).await,
            Err(CapabilityError::NoMedia(_))
        ));

        std::fs::write(&tiny, vec![0x1au8; 4096]).unwrap();
        assert!(validate_download(&tiny).await.is_ok());
        assert_eq!(locate_download(dir.path()).await.unwrap(), tiny);
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PipelineConfig {
    pub store: StoreSection,
    pub queue: QueueSection,
    pub paths: PathsSection,
    pub limits: LimitsSection,
    pub timeouts: TimeoutsSection,
    pub retry: RetrySection,
    pub retention: RetentionSection,
    pub tools: ToolsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub task_db: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            task_db: PathBuf::from("data/tasks.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub queue_db: PathBuf,
    /// Refuse to start on the in-process fallback when the durable queue is unreachable.
    pub require_durable: bool,
    pub poll_interval_ms: u64,
    pub lease_grace_seconds: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            queue_db: PathBuf::from("data/queue.sqlite"),
            require_durable: false,
            poll_interval_ms: 500,
            lease_grace_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub temp_dir: PathBuf,
    pub storage_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("/tmp/audiopipe"),
            storage_dir: PathBuf::from("/tmp/audiopipe/output"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_concurrent_downloads: u32,
    pub max_concurrent_transcodes: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            max_concurrent_transcodes: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub fetch_seconds: u64,
    pub transcode_seconds: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            fetch_seconds: 600,
            transcode_seconds: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_seconds: 2,
            max_delay_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub artifact_ttl_hours: u64,
    pub sweep_interval_seconds: u64,
    pub temp_max_age_hours: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            artifact_ttl_hours: 7 * 24,
            sweep_interval_seconds: 3600,
            temp_max_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub downloader: PathBuf,
    pub transcoder: PathBuf,
    pub audio_bitrate: String,
    pub max_duration_seconds: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            downloader: PathBuf::from("yt-dlp"),
            transcoder: PathBuf::from("ffmpeg"),
            audio_bitrate: "192k".to_string(),
            max_duration_seconds: 600,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `AUDIOPIPE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("AUDIOPIPE_TASK_DB") {
            self.store.task_db = PathBuf::from(value);
        }
        if let Some(value) = lookup("AUDIOPIPE_QUEUE_DB") {
            self.queue.queue_db = PathBuf::from(value);
        }
        if let Some(value) = lookup("AUDIOPIPE_TEMP_DIR") {
            self.paths.temp_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("AUDIOPIPE_STORAGE_DIR") {
            self.paths.storage_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("AUDIOPIPE_FETCH_TIMEOUT") {
            self.timeouts.fetch_seconds = parse_override("AUDIOPIPE_FETCH_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("AUDIOPIPE_TRANSCODE_TIMEOUT") {
            self.timeouts.transcode_seconds =
                parse_override("AUDIOPIPE_TRANSCODE_TIMEOUT", &value)?;
        }
        for key in ["MAX_CONCURRENT_DOWNLOADS", "AUDIOPIPE_MAX_CONCURRENT_DOWNLOADS"] {
            if let Some(value) = lookup(key) {
                self.limits.max_concurrent_downloads = parse_override(key, &value)?;
            }
        }
        if let Some(value) = lookup("AUDIOPIPE_ARTIFACT_TTL_HOURS") {
            self.retention.artifact_ttl_hours =
                parse_override("AUDIOPIPE_ARTIFACT_TTL_HOURS", &value)?;
        }
        if let Some(value) = lookup("AUDIOPIPE_SWEEP_INTERVAL") {
            self.retention.sweep_interval_seconds =
                parse_override("AUDIOPIPE_SWEEP_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("AUDIOPIPE_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_override("AUDIOPIPE_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("AUDIOPIPE_MAX_DURATION") {
            self.tools.max_duration_seconds = parse_override("AUDIOPIPE_MAX_DURATION", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_concurrent_downloads must be greater than zero".into(),
            ));
        }
        if self.limits.max_concurrent_transcodes == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_concurrent_transcodes must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }
        if self.retention.artifact_ttl_hours == 0 {
            return Err(ConfigError::Invalid(
                "retention.artifact_ttl_hours must be greater than zero".into(),
            ));
        }
        if self.retention.sweep_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "retention.sweep_interval_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.fetch_seconds)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.transcode_seconds)
    }

    pub fn artifact_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention.artifact_ttl_hours as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention.sweep_interval_seconds)
    }

    pub fn temp_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention.temp_max_age_hours as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms.max(10))
    }
}

pub fn load_pipeline_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let config: PipelineConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

/// Loads the file when it exists, falls back to defaults otherwise, then
/// applies environment overrides.
pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        load_toml(path)?
    } else {
        PipelineConfig::default()
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::Override {
        key: key.to_string(),
        value: value.to_string(),
    })
}

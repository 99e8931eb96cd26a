use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use audiopipe_core::{
    load_with_env, AudioPipeline, DispatcherBackend, DrainReport, FfmpegTranscoder,
    MediaFetcher, MediaTranscoder, PipelineConfig, PipelineError, QueueCount, StageQueue,
    SubmitReceipt, SubmitRequest, SweepReport, Task, TaskFilter, TaskStage, TaskStatusView,
    YtDlpFetcher,
};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

pub type Result<T> = std::result::Result<T, AppError>;

const TOOL_CHECK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] audiopipe_core::ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("task store error: {0}")]
    Store(#[from] audiopipe_core::TaskError),
    #[error("queue error: {0}")]
    Queue(#[from] audiopipe_core::QueueError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("health check failed: {0}")]
    Unhealthy(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio pipeline command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to audiopipe.toml
    #[arg(long, default_value = "configs/audiopipe.toml")]
    pub config: PathBuf,
    /// Alternative path for tasks.sqlite
    #[arg(long)]
    pub task_db: Option<PathBuf>,
    /// Alternative path for queue.sqlite
    #[arg(long)]
    pub queue_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue a source reference for download and conversion
    Submit(SubmitArgs),
    /// Show the state of a task
    Status(TaskArgs),
    /// Save a finished task's audio file
    Download(DownloadArgs),
    /// Ask a running task to stop
    Cancel(TaskArgs),
    /// Run stage workers and the expiry sweep until interrupted
    Worker(WorkerArgs),
    /// Evict expired tasks and stale temporary files
    Sweep(SweepArgs),
    /// Process every ready job in this process, then exit
    Drain,
    /// Task store operations
    #[command(subcommand)]
    Tasks(TaskCommands),
    /// Job queue operations
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Run basic health checks
    Health,
    /// Print shell completions
    Completions(CompletionArgs),
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// URL or opaque reference understood by the downloader
    pub reference: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub channel: Option<String>,
    #[arg(long)]
    pub thumbnail: Option<String>,
}

#[derive(Args, Debug)]
pub struct TaskArgs {
    pub task_id: String,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    pub task_id: String,
    /// Destination file; defaults to the suggested filename in the current directory
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StageArg {
    Fetch,
    Transcode,
    Cleanup,
}

impl From<StageArg> for StageQueue {
    fn from(value: StageArg) -> Self {
        match value {
            StageArg::Fetch => StageQueue::Fetch,
            StageArg::Transcode => StageQueue::Transcode,
            StageArg::Cleanup => StageQueue::Cleanup,
        }
    }
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Stages to serve; all of them when omitted
    #[arg(long = "stage", value_enum)]
    pub stages: Vec<StageArg>,
    /// Runners per stage, capped by the configured limits
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Do not run the expiry sweep in this process
    #[arg(long, default_value_t = false)]
    pub no_sweep: bool,
}

#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Sweep once and exit instead of running on the configured interval
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// List tasks, newest first
    List(TaskListArgs),
    /// Copy the task database to a file
    Backup(BackupArgs),
}

#[derive(Args, Debug)]
pub struct TaskListArgs {
    /// Filter by stage
    #[arg(long)]
    pub stage: Option<String>,
    /// Maximum number of rows
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Job counts per stage and state
    Show,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let fallback = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(args.shell, &mut command, name, &mut io::stdout());
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_async(cli))
}

async fn run_async(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Submit(args) => {
            let receipt = context.submit(args).await?;
            render(&receipt, cli.format)?;
        }
        Commands::Status(args) => {
            let status = context.status(&args.task_id).await?;
            render(&status, cli.format)?;
        }
        Commands::Download(args) => {
            let result = context.download(args).await?;
            render(&result, cli.format)?;
        }
        Commands::Cancel(args) => {
            let task = context.cancel(&args.task_id).await?;
            render(&task, cli.format)?;
        }
        Commands::Worker(args) => context.run_workers(args).await?,
        Commands::Sweep(args) => {
            if args.once {
                let report = context.sweep_once().await?;
                render(&report, cli.format)?;
            } else {
                context.run_sweeper().await?;
            }
        }
        Commands::Drain => {
            let report = context.drain().await?;
            render(&report, cli.format)?;
        }
        Commands::Tasks(TaskCommands::List(args)) => {
            let list = context.task_list(args).await?;
            render(&list, cli.format)?;
        }
        Commands::Tasks(TaskCommands::Backup(args)) => {
            let result = context.backup(&args.output).await?;
            render(&result, cli.format)?;
        }
        Commands::Queue(QueueCommands::Show) => {
            let list = context.queue_show().await?;
            render(&list, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check().await;
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::Unhealthy(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: PipelineConfig,
    config_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_with_env(&cli.config)?;
        if let Some(path) = &cli.task_db {
            config.store.task_db = path.clone();
        }
        if let Some(path) = &cli.queue_db {
            config.queue.queue_db = path.clone();
        }
        Ok(Self {
            config,
            config_path: cli.config.clone(),
        })
    }

    async fn pipeline(&self) -> Result<AudioPipeline> {
        Ok(AudioPipeline::connect(self.config.clone()).await?)
    }

    /// The fetch job has to outlive this process, so the in-process queue is
    /// refused for submissions.
    async fn durable_pipeline(&self) -> Result<AudioPipeline> {
        let mut config = self.config.clone();
        config.queue.require_durable = true;
        Ok(AudioPipeline::connect(config).await?)
    }

    fn tools(&self) -> (Arc<dyn MediaFetcher>, Arc<dyn MediaTranscoder>) {
        (
            Arc::new(YtDlpFetcher::from_config(&self.config.tools)),
            Arc::new(FfmpegTranscoder::from_config(&self.config.tools)),
        )
    }

    async fn submit(&self, args: &SubmitArgs) -> Result<SubmitReceipt> {
        let pipeline = self.durable_pipeline().await?;
        let receipt = pipeline
            .submit(SubmitRequest {
                source_reference: args.reference.clone(),
                title: args.title.clone(),
                channel: args.channel.clone(),
                thumbnail: args.thumbnail.clone(),
            })
            .await?;
        Ok(receipt)
    }

    async fn status(&self, task_id: &str) -> Result<TaskStatusView> {
        Ok(self.pipeline().await?.status(task_id)?)
    }

    async fn download(&self, args: &DownloadArgs) -> Result<DownloadResult> {
        let pipeline = self.pipeline().await?;
        let mut served = pipeline.download(&args.task_id).await?;
        let target = args
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(&served.filename));
        let mut file = tokio::fs::File::create(&target).await?;
        let bytes = tokio::io::copy(&mut served.file, &mut file).await?;
        Ok(DownloadResult {
            task_id: args.task_id.clone(),
            path: target,
            bytes,
            content_type: served.content_type.to_string(),
            download_count: served.download_count,
        })
    }

    async fn cancel(&self, task_id: &str) -> Result<Task> {
        Ok(self.pipeline().await?.cancel(task_id)?)
    }

    async fn run_workers(&self, args: &WorkerArgs) -> Result<()> {
        let pipeline = self.pipeline().await?;
        let stages: Vec<StageQueue> = if args.stages.is_empty() {
            StageQueue::ALL.to_vec()
        } else {
            args.stages.iter().map(|&stage| stage.into()).collect()
        };
        let (fetcher, transcoder) = self.tools();
        let pool = pipeline.start_workers(&stages, fetcher, transcoder, args.concurrency);

        let (stop_sweep, sweep_signal) = watch::channel(false);
        let sweeper = (!args.no_sweep).then(|| {
            let sweeper = pipeline.sweeper();
            tokio::spawn(async move { sweeper.run(sweep_signal).await })
        });

        info!(
            config = %self.config_path.display(),
            runners = pool.len(),
            "workers running, press Ctrl-C to stop"
        );
        tokio::signal::ctrl_c().await?;
        info!("shutdown requested, finishing in-flight jobs");
        pool.shutdown().await;
        stop_sweep.send_replace(true);
        if let Some(handle) = sweeper {
            if let Err(err) = handle.await {
                warn!(error = %err, "expiry sweeper panicked");
            }
        }
        Ok(())
    }

    async fn sweep_once(&self) -> Result<SweepReport> {
        let pipeline = self.pipeline().await?;
        let report = pipeline
            .sweeper()
            .sweep(chrono::Utc::now())
            .await
            .map_err(PipelineError::from)?;
        Ok(report)
    }

    async fn run_sweeper(&self) -> Result<()> {
        let pipeline = self.pipeline().await?;
        let sweeper = pipeline.sweeper();
        let (stop, signal) = watch::channel(false);
        let handle = tokio::spawn(async move { sweeper.run(signal).await });
        tokio::signal::ctrl_c().await?;
        stop.send_replace(true);
        if let Err(err) = handle.await {
            warn!(error = %err, "expiry sweeper panicked");
        }
        Ok(())
    }

    async fn drain(&self) -> Result<DrainReport> {
        let pipeline = self.pipeline().await?;
        let (fetcher, transcoder) = self.tools();
        Ok(pipeline.drain(fetcher, transcoder).await?)
    }

    async fn task_list(&self, args: &TaskListArgs) -> Result<TaskList> {
        let stage = args
            .stage
            .as_deref()
            .map(str::parse::<TaskStage>)
            .transpose()
            .map_err(AppError::InvalidArgument)?;
        let pipeline = self.pipeline().await?;
        let rows = pipeline
            .store()
            .list(&TaskFilter {
                stage,
                limit: Some(args.limit),
            })?
            .into_iter()
            .map(TaskEntry::from)
            .collect();
        Ok(TaskList { rows })
    }

    async fn backup(&self, output: &Path) -> Result<BackupResult> {
        let pipeline = self.pipeline().await?;
        pipeline.store().backup_to(output)?;
        Ok(BackupResult {
            source: pipeline.store().path().to_path_buf(),
            output: output.to_path_buf(),
        })
    }

    async fn queue_show(&self) -> Result<QueueList> {
        let pipeline = self.pipeline().await?;
        let rows = pipeline.dispatcher().counts().await?;
        Ok(QueueList {
            backend: pipeline.dispatcher().backend(),
            rows,
        })
    }

    async fn health_check(&self) -> Vec<HealthEntry> {
        let mut entries = vec![
            self.check_directory("temp_dir", &self.config.paths.temp_dir),
            self.check_directory("storage_dir", &self.config.paths.storage_dir),
            self.check_tool("downloader", &self.config.tools.downloader, "--version")
                .await,
            self.check_tool("transcoder", &self.config.tools.transcoder, "-version")
                .await,
        ];
        match self.pipeline().await {
            Ok(pipeline) => match pipeline.health().await {
                Ok(report) => {
                    entries.push(HealthEntry::ok(
                        "task_db",
                        format!(
                            "{} ({} tasks)",
                            report.task_db.display(),
                            report.tasks.values().sum::<usize>()
                        ),
                    ));
                    entries.push(match report.backend {
                        DispatcherBackend::Durable => HealthEntry::ok(
                            "job_queue",
                            self.config.queue.queue_db.display().to_string(),
                        ),
                        DispatcherBackend::Local => HealthEntry::warn(
                            "job_queue",
                            "durable queue unreachable, using in-process fallback",
                        ),
                    });
                }
                Err(err) => entries.push(HealthEntry::error("pipeline", err.to_string())),
            },
            Err(err) => entries.push(HealthEntry::error("pipeline", err.to_string())),
        }
        entries
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        if path.is_dir() {
            HealthEntry::ok(name, path.display().to_string())
        } else if path.exists() {
            HealthEntry::error(name, format!("{} is not a directory", path.display()))
        } else {
            HealthEntry::warn(name, format!("{} will be created", path.display()))
        }
    }

    /// Runs the tool's version command the same way the adapters spawn it.
    async fn check_tool(&self, name: &str, binary: &Path, version_flag: &str) -> HealthEntry {
        let mut command = Command::new(binary);
        command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .arg(version_flag);
        match timeout(TOOL_CHECK_TIMEOUT, command.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let version = stdout.lines().next().unwrap_or("").trim();
                HealthEntry::ok(name, format!("{} {version}", binary.display()))
            }
            Ok(Ok(output)) => HealthEntry::error(
                name,
                format!("{} {version_flag} exited with {}", binary.display(), output.status),
            ),
            Ok(Err(err)) => {
                HealthEntry::error(name, format!("{} cannot run: {err}", binary.display()))
            }
            Err(_) => HealthEntry::error(
                name,
                format!(
                    "{} {version_flag} gave no answer within {}s",
                    binary.display(),
                    TOOL_CHECK_TIMEOUT.as_secs()
                ),
            ),
        }
    }
}

impl DisplayFallback for SubmitReceipt {
    fn display(&self) -> String {
        format!("{}\t{}\t{}", self.task_id, self.stage, self.message)
    }
}

impl DisplayFallback for TaskStatusView {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Task: {}", self.task_id),
            format!("Stage: {} ({}%)", self.stage, self.progress),
            format!("Message: {}", self.message),
        ];
        if let Some(title) = &self.title {
            lines.push(format!("Title: {title}"));
        }
        if let Some(channel) = &self.channel {
            lines.push(format!("Channel: {channel}"));
        }
        if let Some(error) = &self.error {
            lines.push(format!("Error: {error}"));
        }
        if let Some(size) = &self.artifact_size_formatted {
            lines.push(format!("Size: {size}"));
        }
        lines.push(format!("Downloads: {}", self.download_count));
        if let Some(text) = &self.expires_text {
            lines.push(text.clone());
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Task {
    fn display(&self) -> String {
        let cancel = if self.cancel_requested {
            " (cancel requested)"
        } else {
            ""
        };
        format!("{}\t{}{}\t{}", self.id, self.stage, cancel, self.message)
    }
}

impl DisplayFallback for SweepReport {
    fn display(&self) -> String {
        format!(
            "Evicted {} task(s), removed {} artifact(s) ({} bytes), {} stale temp entr(ies)",
            self.tasks_evicted,
            self.artifacts_removed,
            self.bytes_freed,
            self.stale_temp_entries_removed
        )
    }
}

impl DisplayFallback for DrainReport {
    fn display(&self) -> String {
        format!(
            "Processed {} job(s): {} completed, {} skipped, {} retrying, {} dead-lettered",
            self.processed(),
            self.completed,
            self.skipped,
            self.retried,
            self.dead_lettered
        )
    }
}

impl DisplayFallback for TaskList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No tasks found".to_string();
        }
        let mut lines = vec!["TASK\tSTAGE\tPROGRESS\tDOWNLOADS\tTITLE".to_string()];
        for row in &self.rows {
            lines.push(format!(
                "{}\t{}\t{}%\t{}\t{}",
                row.task_id,
                row.stage,
                row.progress,
                row.download_count,
                row.title.as_deref().unwrap_or("-")
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for QueueList {
    fn display(&self) -> String {
        let mut lines = vec![format!("Backend: {}", self.backend)];
        if self.rows.is_empty() {
            lines.push("No jobs".to_string());
            return lines.join("\n");
        }
        let mut by_queue: BTreeMap<StageQueue, Vec<String>> = BTreeMap::new();
        for row in &self.rows {
            by_queue
                .entry(row.queue)
                .or_default()
                .push(format!("{}={}", row.state, row.count));
        }
        for (queue, states) in by_queue {
            lines.push(format!("{queue}: {}", states.join(", ")));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for DownloadResult {
    fn display(&self) -> String {
        format!(
            "Saved {} bytes to {} (download #{})",
            self.bytes,
            self.path.display(),
            self.download_count
        )
    }
}

impl DisplayFallback for BackupResult {
    fn display(&self) -> String {
        format!(
            "Backed up {} to {}",
            self.source.display(),
            self.output.display()
        )
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct DownloadResult {
    pub task_id: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub content_type: String,
    pub download_count: u64,
}

#[derive(Debug, Serialize)]
pub struct TaskList {
    pub rows: Vec<TaskEntry>,
}

#[derive(Debug, Serialize)]
pub struct TaskEntry {
    pub task_id: String,
    pub stage: TaskStage,
    pub progress: u8,
    pub title: Option<String>,
    pub download_count: u64,
    pub created_at: String,
    pub expires_at: String,
}

impl From<Task> for TaskEntry {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            stage: task.stage,
            progress: task.progress,
            title: task.metadata.title,
            download_count: task.download_count,
            created_at: task.created_at.to_rfc3339(),
            expires_at: task.expires_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueueList {
    pub backend: DispatcherBackend,
    pub rows: Vec<QueueCount>,
}

#[derive(Debug, Serialize)]
pub struct BackupResult {
    pub source: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warn,
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{label}")
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!("[{}] {}: {}", self.status, self.name, self.detail)
    }
}

pub mod capability;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod queue;
pub mod sqlite;
pub mod task;
pub mod worker;

pub use capability::{
    CapabilityError, FetchOutput, FfmpegTranscoder, MediaFetcher, MediaMetadata, MediaTranscoder,
    NoProgress, ProgressControl, ProgressSink, YtDlpFetcher,
};
pub use config::{load_pipeline_config, load_with_env, PipelineConfig};
pub use error::{ConfigError, Result};
pub use lifecycle::{
    expires_text, format_size, suggested_filename, ExpirySweeper, FileLifecycle, LifecycleError,
    ServedArtifact, SweepReport, TaskStatusView, AUDIO_CONTENT_TYPE,
};
pub use pipeline::{
    validate_reference, AudioPipeline, DrainReport, HealthReport, PipelineError, PipelineResult,
    SubmitReceipt, SubmitRequest,
};
pub use queue::{
    connect_dispatcher, DispatcherBackend, EnqueueOutcome, Job, JobDispatcher, JobPayload,
    JobState, LocalJobQueue, QueueCount, QueueError, QueueResult, QueueSettings, SqliteJobQueue,
    SqliteJobQueueBuilder, StageQueue,
};
pub use task::{
    Artifact, NewTask, SqliteTaskStore, SqliteTaskStoreBuilder, Task, TaskError, TaskFilter,
    TaskMetadata, TaskPatch, TaskResult, TaskStage,
};
pub use worker::runner::JobDisposition;
pub use worker::{
    ArtifactPaths, RetryPolicy, StageHandler, StageOutcome, StageRunner, WorkerError, WorkerPool,
    WorkerResult,
};

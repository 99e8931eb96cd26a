pub mod error;
pub mod models;
pub mod store;

pub use error::{TaskError, TaskResult};
pub use models::{Artifact, NewTask, Task, TaskFilter, TaskMetadata, TaskPatch, TaskStage};
pub use store::{SqliteTaskStore, SqliteTaskStoreBuilder};

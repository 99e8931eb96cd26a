use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rusqlite::backup::Backup;
use rusqlite::types::Value;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use super::error::{TaskError, TaskResult};
use super::models::{NewTask, Task, TaskFilter, TaskPatch, TaskStage};
use crate::sqlite::{open_configured, open_flags};

const TASK_SCHEMA: &str = include_str!("../../../sql/tasks.sql");
const ID_ATTEMPTS: usize = 4;

pub fn new_task_id() -> String {
    format!("task-{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone)]
pub struct SqliteTaskStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    ttl: Duration,
}

impl Default for SqliteTaskStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            ttl: Duration::days(7),
        }
    }
}

impl SqliteTaskStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Lifetime of a task record, counted from creation.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn build(self) -> TaskResult<SqliteTaskStore> {
        let path = self.path.ok_or(TaskError::MissingStore)?;
        Ok(SqliteTaskStore {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
            ttl: self.ttl,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    path: PathBuf,
    flags: OpenFlags,
    ttl: Duration,
}

impl SqliteTaskStore {
    pub fn builder() -> SqliteTaskStoreBuilder {
        SqliteTaskStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> TaskResult<Self> {
        SqliteTaskStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn open(&self) -> TaskResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| TaskError::Unavailable {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> TaskResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(TASK_SCHEMA)?;
        Ok(())
    }

    pub fn create(&self, new: &NewTask) -> TaskResult<Task> {
        self.create_at(new, Utc::now())
    }

    pub fn create_at(&self, new: &NewTask, now: DateTime<Utc>) -> TaskResult<Task> {
        let conn = self.open()?;
        let expires_at = now + self.ttl;
        for _ in 0..ID_ATTEMPTS {
            let id = new_task_id();
            let inserted = conn.execute(
                "INSERT INTO tasks (
                    id, source_reference, stage, progress, message, title, channel, thumbnail,
                    created_at, updated_at, expires_at
                ) VALUES (?1, ?2, 'pending', 0, 'Task queued for processing', ?3, ?4, ?5, ?6, ?6, ?7)",
                params![
                    &id,
                    &new.source_reference,
                    &new.metadata.title,
                    &new.metadata.channel,
                    &new.metadata.thumbnail,
                    now.naive_utc(),
                    expires_at.naive_utc(),
                ],
            );
            match inserted {
                Ok(_) => {
                    debug!(task_id = %id, "task created");
                    return load(&conn, &id)?.ok_or(TaskError::NotFound { task_id: id });
                }
                Err(rusqlite::Error::SqliteFailure(inner, _))
                    if inner.code == ErrorCode::ConstraintViolation =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(TaskError::IdExhausted)
    }

    pub fn get(&self, id: &str) -> TaskResult<Task> {
        self.find(id)?.ok_or_else(|| TaskError::NotFound {
            task_id: id.to_string(),
        })
    }

    pub fn find(&self, id: &str) -> TaskResult<Option<Task>> {
        let conn = self.open()?;
        load(&conn, id)
    }

    /// Merges `patch` into the stored record in one transaction.
    pub fn update(&self, id: &str, patch: &TaskPatch) -> TaskResult<Task> {
        self.apply(id, None, patch, Utc::now())
    }

    /// Like [`update`](Self::update) but only when the current stage is one
    /// of `expected`; otherwise fails with `StageConflict` and writes nothing.
    pub fn transition(
        &self,
        id: &str,
        expected: &[TaskStage],
        patch: &TaskPatch,
    ) -> TaskResult<Task> {
        self.apply(id, Some(expected), patch, Utc::now())
    }

    /// Runs `op` against a clone of the store on the blocking pool.
    pub async fn blocking<T, F>(&self, op: F) -> TaskResult<T>
    where
        F: FnOnce(&SqliteTaskStore) -> TaskResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store)).await?
    }

    /// [`transition`](Self::transition) off the async executor.
    pub async fn transition_async(
        &self,
        id: &str,
        expected: &[TaskStage],
        patch: &TaskPatch,
    ) -> TaskResult<Task> {
        let id = id.to_string();
        let expected = expected.to_vec();
        let patch = patch.clone();
        self.blocking(move |store| store.transition(&id, &expected, &patch))
            .await
    }

    pub async fn is_cancel_requested_async(&self, id: &str) -> TaskResult<bool> {
        let id = id.to_string();
        self.blocking(move |store| store.is_cancel_requested(&id))
            .await
    }

    fn apply(
        &self,
        id: &str,
        expected: Option<&[TaskStage]>,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> TaskResult<Task> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load(&tx, id)?.ok_or_else(|| TaskError::NotFound {
            task_id: id.to_string(),
        })?;
        if let Some(expected) = expected {
            if !expected.contains(&current.stage) {
                return Err(TaskError::StageConflict {
                    task_id: id.to_string(),
                    actual: current.stage,
                });
            }
        }
        let next = current.apply_patch(patch, now)?;
        write(&tx, &next)?;
        tx.commit()?;
        Ok(next)
    }

    /// Atomically bumps the download counter of a completed, unexpired task.
    pub fn record_download(&self, id: &str, now: DateTime<Utc>) -> TaskResult<u64> {
        let conn = self.open()?;
        let count: Option<i64> = conn
            .query_row(
                "UPDATE tasks SET download_count = download_count + 1, updated_at = ?2
                 WHERE id = ?1 AND stage = 'completed' AND expires_at > ?2
                 RETURNING download_count",
                params![id, now.naive_utc()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(count) = count {
            return Ok(count.max(0) as u64);
        }
        match load(&conn, id)? {
            None => Err(TaskError::NotFound {
                task_id: id.to_string(),
            }),
            Some(task) if task.stage != TaskStage::Completed => Err(TaskError::StageConflict {
                task_id: id.to_string(),
                actual: task.stage,
            }),
            Some(_) => Err(TaskError::Expired {
                task_id: id.to_string(),
            }),
        }
    }

    pub fn request_cancel(&self, id: &str) -> TaskResult<Task> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut task = load(&tx, id)?.ok_or_else(|| TaskError::NotFound {
            task_id: id.to_string(),
        })?;
        if task.stage.terminal() {
            return Err(TaskError::StageConflict {
                task_id: id.to_string(),
                actual: task.stage,
            });
        }
        let now = Utc::now();
        tx.execute(
            "UPDATE tasks SET cancel_requested = 1, updated_at = ?2 WHERE id = ?1",
            params![id, now.naive_utc()],
        )?;
        tx.commit()?;
        task.cancel_requested = true;
        task.updated_at = now;
        Ok(task)
    }

    pub fn is_cancel_requested(&self, id: &str) -> TaskResult<bool> {
        let conn = self.open()?;
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM tasks WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// Removes the record. Returns `false` when it was already gone.
    pub fn delete(&self, id: &str) -> TaskResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    pub fn list(&self, filter: &TaskFilter) -> TaskResult<Vec<Task>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM tasks");
        let mut params: Vec<Value> = Vec::new();
        if let Some(stage) = filter.stage {
            query.push_str(" WHERE stage = ?");
            params.push(Value::Text(stage.as_str().to_string()));
        }
        query.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(Task::from_row(row)?);
        }
        Ok(tasks)
    }

    /// Tasks in any stage whose expiry is at or before `now`. A task that never
    /// reached a terminal stage by then is abandoned and goes too.
    pub fn list_expired(&self, now: DateTime<Utc>) -> TaskResult<Vec<Task>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks
             WHERE expires_at <= ?1
             ORDER BY expires_at ASC",
        )?;
        let mut rows = stmt.query([now.naive_utc()])?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(Task::from_row(row)?);
        }
        Ok(tasks)
    }

    /// Ids of tasks still moving through the pipeline.
    pub fn active_ids(&self) -> TaskResult<HashSet<String>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT id FROM tasks WHERE stage NOT IN ('completed', 'failed')")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ids)
    }

    pub fn count_by_stage(&self) -> TaskResult<HashMap<TaskStage, usize>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT stage, COUNT(*) FROM tasks GROUP BY stage")?;
        let mut rows = stmt.query([])?;
        let mut counts = HashMap::new();
        while let Some(row) = rows.next()? {
            let stage: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            if let Ok(stage) = stage.parse::<TaskStage>() {
                counts.insert(stage, count.max(0) as usize);
            }
        }
        Ok(counts)
    }

    pub fn backup_to(&self, output: impl AsRef<Path>) -> TaskResult<()> {
        let output = output.as_ref();
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let src = self.open()?;
        let mut dst = Connection::open(output)?;
        let backup = Backup::new(&src, &mut dst)?;
        backup.run_to_completion(64, StdDuration::from_millis(5), None)?;
        Ok(())
    }
}

fn load(conn: &Connection, id: &str) -> TaskResult<Option<Task>> {
    let task = conn
        .query_row("SELECT * FROM tasks WHERE id = ?1", [id], Task::from_row)
        .optional()?;
    Ok(task)
}

fn write(conn: &Connection, task: &Task) -> TaskResult<()> {
    let (artifact_path, artifact_size, artifact_size_formatted) = match &task.artifact {
        Some(artifact) => (
            Some(artifact.path.to_string_lossy().into_owned()),
            Some(artifact.size_bytes as i64),
            Some(artifact.size_formatted.clone()),
        ),
        None => (None, None, None),
    };
    conn.execute(
        "UPDATE tasks SET
            stage = ?2, progress = ?3, message = ?4, title = ?5, channel = ?6, thumbnail = ?7,
            error = ?8, artifact_path = ?9, artifact_size = ?10, artifact_size_formatted = ?11,
            updated_at = ?12
         WHERE id = ?1",
        params![
            &task.id,
            task.stage.as_str(),
            task.progress as i64,
            &task.message,
            &task.metadata.title,
            &task.metadata.channel,
            &task.metadata.thumbnail,
            &task.error,
            artifact_path,
            artifact_size,
            artifact_size_formatted,
            task.updated_at.naive_utc(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Artifact, TaskMetadata};
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SqliteTaskStore) {
        let dir = tempdir().unwrap();
        let store = SqliteTaskStore::new(dir.path().join("tasks.sqlite")).unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    #[test]
    fn create_assigns_pending_record() {
        let (_dir, store) = store();
        let now = Utc::now();
        let task = store.create_at(&NewTask::new("ref-a"), now).unwrap();
        assert!(task.id.starts_with("task-"));
        assert_eq!(task.id.len(), "task-".len() + 32);
        assert_eq!(task.stage, TaskStage::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.message, "Task queued for processing");
        assert_eq!(task.expires_at - task.created_at, Duration::days(7));

        let other = store.create(&NewTask::new("ref-a")).unwrap();
        assert_ne!(task.id, other.id);
    }

    #[test]
    fn transition_checks_expected_stage() {
        let (_dir, store) = store();
        let task = store.create(&NewTask::new("ref")).unwrap();
        let err = store
            .transition(
                &task.id,
                &[TaskStage::Fetching],
                &TaskPatch::new().stage(TaskStage::Transcoding),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::StageConflict {
                actual: TaskStage::Pending,
                ..
            }
        ));

        let fetching = store
            .transition(
                &task.id,
                &[TaskStage::Pending, TaskStage::Fetching],
                &TaskPatch::new().stage(TaskStage::Fetching).progress(5),
            )
            .unwrap();
        assert_eq!(fetching.stage, TaskStage::Fetching);
        assert_eq!(store.get(&task.id).unwrap().progress, 5);
    }

    #[test]
    fn record_download_only_counts_servable_tasks() {
        let (_dir, store) = store();
        let task = store.create(&NewTask::new("ref")).unwrap();
        let err = store.record_download(&task.id, Utc::now()).unwrap_err();
        assert!(matches!(err, TaskError::StageConflict { .. }));

        store
            .update(&task.id, &TaskPatch::new().stage(TaskStage::Fetching))
            .unwrap();
        store
            .update(&task.id, &TaskPatch::new().stage(TaskStage::Transcoding))
            .unwrap();
        store
            .update(
                &task.id,
                &TaskPatch::new()
                    .stage(TaskStage::Completed)
                    .progress(100)
                    .artifact(Artifact::new("/tmp/x.mp3", 4096)),
            )
            .unwrap();

        assert_eq!(store.record_download(&task.id, Utc::now()).unwrap(), 1);
        assert_eq!(store.record_download(&task.id, Utc::now()).unwrap(), 2);

        let late = task.expires_at + Duration::seconds(1);
        let err = store.record_download(&task.id, late).unwrap_err();
        assert!(matches!(err, TaskError::Expired { .. }));
        assert_eq!(store.get(&task.id).unwrap().download_count, 2);
    }

    #[test]
    fn cancel_and_expiry_listing() {
        let (_dir, store) = store();
        let live = store.create(&NewTask::new("live")).unwrap();
        let dead = store.create(&NewTask::new("dead")).unwrap();
        store.request_cancel(&live.id).unwrap();
        assert!(store.is_cancel_requested(&live.id).unwrap());
        assert!(!store.is_cancel_requested(&dead.id).unwrap());

        store.update(&dead.id, &TaskPatch::failed("boom")).unwrap();
        let err = store.request_cancel(&dead.id).unwrap_err();
        assert!(matches!(err, TaskError::StageConflict { .. }));

        let later = dead.expires_at + Duration::minutes(1);
        assert!(store.list_expired(Utc::now()).unwrap().is_empty());
        let expired = store.list_expired(later).unwrap();
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().any(|task| task.id == live.id));
        assert!(expired.iter().any(|task| task.id == dead.id));

        let active = store.active_ids().unwrap();
        assert!(active.contains(&live.id));
        assert!(!active.contains(&dead.id));

        let counts = store.count_by_stage().unwrap();
        assert_eq!(counts.get(&TaskStage::Pending), Some(&1));
        assert_eq!(counts.get(&TaskStage::Failed), Some(&1));

        assert!(store.delete(&dead.id).unwrap());
        assert!(!store.delete(&dead.id).unwrap());
    }

    #[test]
    fn metadata_survives_round_trip_and_backup() {
        let (dir, store) = store();
        let task = store
            .create(&NewTask::new("ref").with_metadata(TaskMetadata {
                title: Some("Title".into()),
                channel: None,
                thumbnail: None,
            }))
            .unwrap();
        store
            .update(
                &task.id,
                &TaskPatch::new().metadata(TaskMetadata {
                    channel: Some("Chan".into()),
                    ..TaskMetadata::default()
                }),
            )
            .unwrap();

        let backup = dir.path().join("backup/tasks.sqlite");
        store.backup_to(&backup).unwrap();
        let restored = SqliteTaskStore::new(&backup).unwrap().get(&task.id).unwrap();
        assert_eq!(restored.metadata.title.as_deref(), Some("Title"));
        assert_eq!(restored.metadata.channel.as_deref(), Some("Chan"));
    }
}

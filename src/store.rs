//! Durable, crash-safe persistence for tasks, checkpoints, and audit records.
//!
//! The store is a directory tree of small JSON documents:
//!
//! ```text
//! <root>/tasks/<task_id>/task.json
//! <root>/tasks/<task_id>/checkpoint.json
//! <root>/tasks/<task_id>/errors/<n>.json
//! <root>/samples/<sample_id>.json
//! <root>/validations/<validation_id>.json
//! ```
//!
//! Every write goes through a temp-file-and-rename so a crash mid-write
//! never leaves a torn document behind. The store is the single system of
//! record: every other component persists through it and holds tasks by id.

use std::{fs, io::Write as _};

use chrono::Duration;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    prelude::*,
    task::{Checkpoint, Task, TaskError, TaskFilter},
};

/// A file-backed task store rooted at a directory.
#[derive(Clone, Debug)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["tasks", "samples", "validations"] {
            fs::create_dir_all(root.join(dir))
                .with_context(|| format!("failed to create store directory {:?}", root))?;
        }
        Ok(Self { root })
    }

    /// The directory holding one task's records.
    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("tasks").join(task_id)
    }

    /// Upsert a task record. Atomic and idempotent by id.
    ///
    /// A successful write of a terminal task is durable: the document is
    /// synced before the rename, so a crash immediately afterwards still
    /// yields the same record on restart.
    #[instrument(level = "trace", skip_all, fields(task_id = %task.task_id))]
    pub async fn put_task(&self, task: &Task) -> Result<()> {
        let dir = self.task_dir(&task.task_id);
        let task = task.clone();
        spawn_blocking_propagating_panics(move || {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create task directory {:?}", dir))?;
            write_json_atomic(&dir.join("task.json"), &task)
        })
        .await
    }

    /// Fetch a task by id.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let path = self.task_dir(task_id).join("task.json");
        spawn_blocking_propagating_panics(move || read_json_opt(&path)).await
    }

    /// List tasks matching `filter`, newest first by `added_at`.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let tasks_dir = self.root.join("tasks");
        let filter = filter.clone();
        spawn_blocking_propagating_panics(move || {
            let mut tasks = vec![];
            for entry in fs::read_dir(&tasks_dir)
                .with_context(|| format!("failed to read {:?}", tasks_dir))?
            {
                let entry = entry?;
                let path = entry.path().join("task.json");
                // Tolerate directories mid-creation or mid-delete.
                let Some(task) = read_json_opt::<Task>(&path)? else {
                    continue;
                };
                if filter.matches(&task) {
                    tasks.push(task);
                }
            }
            tasks.sort_by(|a, b| b.added_at.cmp(&a.added_at));
            Ok(tasks)
        })
        .await
    }

    /// Write the latest checkpoint for a task, compacting any older one.
    #[instrument(level = "trace", skip_all, fields(task_id = %checkpoint.task_id))]
    pub async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.task_dir(&checkpoint.task_id).join("checkpoint.json");
        let checkpoint = checkpoint.clone();
        spawn_blocking_propagating_panics(move || {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_json_atomic(&path, &checkpoint)
        })
        .await
    }

    /// Load the newest checkpoint for a task, if one survives.
    pub async fn load_latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.task_dir(task_id).join("checkpoint.json");
        spawn_blocking_propagating_panics(move || read_json_opt(&path)).await
    }

    /// Drop a task's checkpoint, typically once the task is terminal.
    pub async fn delete_checkpoint(&self, task_id: &str) -> Result<()> {
        let path = self.task_dir(task_id).join("checkpoint.json");
        spawn_blocking_propagating_panics(move || {
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(err).with_context(|| format!("failed to delete {:?}", path))
                }
            }
        })
        .await
    }

    /// Append an error record for a task.
    pub async fn append_error(&self, task_id: &str, error: &TaskError) -> Result<()> {
        let dir = self.task_dir(task_id).join("errors");
        let error = error.clone();
        spawn_blocking_propagating_panics(move || {
            fs::create_dir_all(&dir)?;
            let n = fs::read_dir(&dir)?.count();
            write_json_atomic(&dir.join(format!("{n}.json")), &error)
        })
        .await
    }

    /// Load all error records for a task, oldest first.
    pub async fn load_errors(&self, task_id: &str) -> Result<Vec<TaskError>> {
        let dir = self.task_dir(task_id).join("errors");
        spawn_blocking_propagating_panics(move || {
            if !dir.is_dir() {
                return Ok(vec![]);
            }
            let mut paths: Vec<PathBuf> =
                fs::read_dir(&dir)?.map(|e| Ok(e?.path())).collect::<Result<_>>()?;
            // File names are sequence numbers; sort numerically so `10.json`
            // lands after `2.json`.
            paths.sort_by_key(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(usize::MAX)
            });
            paths
                .into_iter()
                .filter_map(|p| read_json_opt(&p).transpose())
                .collect()
        })
        .await
    }

    /// Delete a task and everything it owns.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let dir = self.task_dir(task_id);
        spawn_blocking_propagating_panics(move || {
            if !dir.is_dir() {
                return Ok(false);
            }
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to delete task directory {:?}", dir))?;
            Ok(true)
        })
        .await
    }

    /// Remove terminal tasks whose `completed_at` is older than `retention`.
    ///
    /// Returns the ids of the removed tasks so the queue can drop its own
    /// bookkeeping for them.
    #[instrument(level = "debug", skip_all)]
    pub async fn sweep_completed(&self, retention: Duration) -> Result<Vec<String>> {
        let threshold = Utc::now() - retention;
        let all = self.list_tasks(&TaskFilter::default()).await?;
        let mut removed = vec![];
        for task in all {
            if !task.status.is_terminal() {
                continue;
            }
            let Some(completed_at) = task.completed_at else {
                continue;
            };
            if completed_at < threshold && self.delete_task(&task.task_id).await? {
                removed.push(task.task_id);
            }
        }
        if !removed.is_empty() {
            info!("retention sweep removed {} terminal tasks", removed.len());
        }
        Ok(removed)
    }

    /// Persist an audit record under `samples/` or `validations/`.
    pub async fn put_audit_record<T>(&self, kind: AuditKind, id: &str, record: &T) -> Result<()>
    where
        T: Serialize + Send + Sync,
    {
        let path = self.root.join(kind.dir()).join(format!("{id}.json"));
        let value = serde_json::to_value(record)?;
        spawn_blocking_propagating_panics(move || write_json_atomic(&path, &value)).await
    }

    /// Load an audit record by kind and id.
    pub async fn get_audit_record<T>(&self, kind: AuditKind, id: &str) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        let path = self.root.join(kind.dir()).join(format!("{id}.json"));
        spawn_blocking_propagating_panics(move || read_json_opt(&path)).await
    }
}

/// Which audit collection a record belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuditKind {
    Sample,
    Validation,
}

impl AuditKind {
    fn dir(self) -> &'static str {
        match self {
            AuditKind::Sample => "samples",
            AuditKind::Validation => "validations",
        }
    }
}

/// Serialize `value` to `path` via a synced temp file and rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("store path {:?} has no parent", path))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {:?}", dir))?;
    serde_json::to_writer(&mut tmp, value).context("failed to serialize store record")?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("failed to persist {:?}", path))?;
    Ok(())
}

/// Read and parse a JSON document, returning `None` if it does not exist.
fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {:?}", path)),
    };
    let value = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {:?}", path))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::task::{ErrorKind, OcrOptions, Priority, TaskStatus};

    use super::*;

    fn new_task() -> Task {
        Task::new(
            PathBuf::from("/tmp/doc.pdf"),
            None,
            Priority::Normal,
            OcrOptions::default(),
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        let task = new_task();
        store.put_task(&task).await.unwrap();
        let loaded = store.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.task_id, task.task_id);
        assert_eq!(loaded.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        assert!(store.get_task("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_is_idempotent_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        let mut task = new_task();
        store.put_task(&task).await.unwrap();
        task.progress = 0.5;
        store.put_task(&task).await.unwrap();
        let loaded = store.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 0.5);
    }

    #[tokio::test]
    async fn latest_checkpoint_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        let task = new_task();
        store.put_task(&task).await.unwrap();

        let mut cp = Checkpoint {
            task_id: task.task_id.clone(),
            attempt_id: "a1".to_owned(),
            created_at: Utc::now(),
            state: json!({"chunks": []}),
            current_page: 5,
            total_pages: 20,
            progress: 0.25,
        };
        store.put_checkpoint(&cp).await.unwrap();
        cp.current_page = 10;
        cp.progress = 0.5;
        store.put_checkpoint(&cp).await.unwrap();

        let loaded = store
            .load_latest_checkpoint(&task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.current_page, 10);
        assert_eq!(loaded.progress, 0.5);
    }

    #[tokio::test]
    async fn errors_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        let task = new_task();
        store.put_task(&task).await.unwrap();

        store
            .append_error(&task.task_id, &TaskError::new(ErrorKind::Timeout, "slow", true))
            .await
            .unwrap();
        store
            .append_error(&task.task_id, &TaskError::new(ErrorKind::Ocr, "bad scan", true))
            .await
            .unwrap();

        let errors = store.load_errors(&task.task_id).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].kind, ErrorKind::Timeout);
        assert_eq!(errors[1].kind, ErrorKind::Ocr);
    }

    #[tokio::test]
    async fn delete_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        let task = new_task();
        store.put_task(&task).await.unwrap();
        store
            .append_error(&task.task_id, &TaskError::new(ErrorKind::Ocr, "x", true))
            .await
            .unwrap();

        assert!(store.delete_task(&task.task_id).await.unwrap());
        assert!(store.get_task(&task.task_id).await.unwrap().is_none());
        assert!(store.load_errors(&task.task_id).await.unwrap().is_empty());
        // Deleting again reports nothing to delete.
        assert!(!store.delete_task(&task.task_id).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_only_old_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();

        let mut old = new_task();
        old.status = TaskStatus::Completed;
        old.completed_at = Some(Utc::now() - Duration::hours(48));
        store.put_task(&old).await.unwrap();

        let mut fresh = new_task();
        fresh.status = TaskStatus::Completed;
        fresh.completed_at = Some(Utc::now());
        store.put_task(&fresh).await.unwrap();

        let running = new_task();
        store.put_task(&running).await.unwrap();

        let removed = store.sweep_completed(Duration::hours(24)).await.unwrap();
        assert_eq!(removed, vec![old.task_id.clone()]);
        assert!(store.get_task(&old.task_id).await.unwrap().is_none());
        assert!(store.get_task(&fresh.task_id).await.unwrap().is_some());
        assert!(store.get_task(&running.task_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        let queued = new_task();
        store.put_task(&queued).await.unwrap();
        let mut failed = new_task();
        failed.status = TaskStatus::Failed;
        store.put_task(&failed).await.unwrap();

        let filter = TaskFilter {
            statuses: Some(vec![TaskStatus::Failed]),
            ..TaskFilter::default()
        };
        let tasks = store.list_tasks(&filter).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, failed.task_id);
    }
}

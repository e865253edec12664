use crate::error::Result;
use crate::io::{atomic_write, remove_if_exists};
use crate::queue::TaskQueue;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecoveryFile {
    #[serde(default)]
    remaining_tasks: Vec<Task>,
}

/// Durable home for tasks that were still queued at shutdown.
#[derive(Debug, Clone)]
pub struct TaskLog {
    path: PathBuf,
}

impl TaskLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomically replace the log with `tasks`, in order.
    pub fn write(&self, tasks: &[Task]) -> Result<()> {
        let file = RecoveryFile {
            remaining_tasks: tasks.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        atomic_write(&self.path, &data)
    }

    /// Tasks in the log; empty when there is no log.
    pub fn read(&self) -> Result<Vec<Task>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read(&self.path)?;
        let file: RecoveryFile = serde_json::from_slice(&data)?;
        Ok(file.remaining_tasks)
    }

    pub fn delete(&self) -> Result<bool> {
        remove_if_exists(&self.path)
    }

    /// Move every logged task onto `queue` in order, then remove the log.
    /// Returns the number of tasks restored.
    pub fn drain_into(&self, queue: &TaskQueue) -> Result<usize> {
        let tasks = self.read()?;
        let count = tasks.len();
        for task in tasks {
            queue.push(task);
        }
        if self.delete()? {
            tracing::info!(count, path = %self.path.display(), "restored tasks from recovery file");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Query;
    use tempfile::TempDir;

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = TaskLog::new(dir.path().join("remaining_tasks.json"));
        assert!(log.read().unwrap().is_empty());
        assert!(!log.delete().unwrap());
    }

    #[test]
    fn write_uses_remaining_tasks_key() {
        let dir = TempDir::new().unwrap();
        let log = TaskLog::new(dir.path().join("remaining_tasks.json"));
        log.write(&[Task::drop("logins")]).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(log.path()).unwrap()).unwrap();
        assert_eq!(raw["remaining_tasks"].as_array().unwrap().len(), 1);
        assert_eq!(raw["remaining_tasks"][0]["target"], "Logins");
    }

    #[test]
    fn drain_restores_order_and_removes_file() {
        let dir = TempDir::new().unwrap();
        let log = TaskLog::new(dir.path().join("remaining_tasks.json"));
        let tasks = vec![
            Task::delete("logins", Query::all().limit(1)),
            Task::drop("sessions"),
            Task::update_count("logins"),
        ];
        log.write(&tasks).unwrap();

        let queue = TaskQueue::new();
        assert_eq!(log.drain_into(&queue).unwrap(), 3);
        assert!(!log.exists());
        let ids: Vec<_> = queue.snapshot().iter().map(Task::id).collect();
        let expected: Vec<_> = tasks.iter().map(Task::id).collect();
        assert_eq!(ids, expected);
    }
}

//! Process-scoped service that wires the queue, registry, executor and
//! worker pool together. Producers only ever talk to an [`Engine`].

use crate::config::{Config, StorageBackend, WarnLevel};
use crate::error::{Result, TrackrError};
use crate::executor::Executor;
use crate::io::ensure_dir;
use crate::paths;
use crate::pool::{PoolStats, TaskOutput, WorkerPool};
use crate::queue::TaskQueue;
use crate::recent::{RecentActivity, RecentEntry};
use crate::recovery::TaskLog;
use crate::registry::{ObjectInfo, Registry};
use crate::schema::{FieldDef, Record};
use crate::storage::{MemoryStorage, RedbStorage, Storage};
use crate::task::Task;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

/// Everything the engine owns except the pool, wired and bootstrapped.
struct Parts {
    queue: Arc<TaskQueue>,
    registry: Arc<Registry>,
    executor: Arc<Executor>,
    recent: Arc<RecentActivity>,
    log: TaskLog,
}

pub struct Engine {
    config: Config,
    queue: Arc<TaskQueue>,
    registry: Arc<Registry>,
    executor: Arc<Executor>,
    recent: Arc<RecentActivity>,
    pool: WorkerPool<Executor>,
    log: TaskLog,
    closed: AtomicBool,
}

impl Engine {
    /// Open the engine for a project root, using the configured backend.
    pub fn open(root: &Path, config: Config) -> Result<Self> {
        let data_dir = paths::trackr_dir(root);
        ensure_dir(&data_dir)?;
        let storage: Arc<dyn Storage> = match config.storage {
            StorageBackend::Redb => Arc::new(RedbStorage::open(&paths::database_path(root))?),
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        };
        Self::open_with_storage(&data_dir, config, storage)
    }

    /// Open over an explicit storage backend. The recovery file lives in
    /// `data_dir`.
    pub fn open_with_storage(
        data_dir: &Path,
        config: Config,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        for warning in config.validate() {
            match warning.level {
                WarnLevel::Error => tracing::error!("config: {}", warning.message),
                WarnLevel::Warning => tracing::warn!("config: {}", warning.message),
            }
        }

        let parts = Self::assemble(data_dir, &config, storage)?;
        let pool = WorkerPool::start(
            Arc::clone(&parts.executor),
            Arc::clone(&parts.queue),
            config.pool.clone(),
        )?;
        tracing::info!(
            objects = parts.registry.list().len(),
            queued = parts.queue.size(),
            "engine open"
        );
        let Parts {
            queue,
            registry,
            executor,
            recent,
            log,
        } = parts;

        Ok(Self {
            config,
            queue,
            registry,
            executor,
            recent,
            pool,
            log,
            closed: AtomicBool::new(false),
        })
    }

    /// Restore saved tasks, then bootstrap. Recovered tasks are queued ahead
    /// of the `update_count` tasks that reflection adds.
    fn assemble(data_dir: &Path, config: &Config, storage: Arc<dyn Storage>) -> Result<Parts> {
        let queue = Arc::new(TaskQueue::new());
        let log = TaskLog::new(data_dir.join(paths::RECOVERY_FILE));
        let restored = log.drain_into(&queue)?;

        let registry = Arc::new(Registry::new(Arc::clone(&queue)));
        let recent = Arc::new(RecentActivity::new(config.recent_capacity));
        let executor = Arc::new(Executor::new(
            storage,
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&recent),
        ));
        if let Err(e) = executor.bootstrap() {
            if restored > 0 {
                log.write(&queue.snapshot())?;
            }
            return Err(e);
        }
        recent.seed(executor.recent_inserts(recent.capacity())?);

        Ok(Parts {
            queue,
            registry,
            executor,
            recent,
            log,
        })
    }

    /// Tasks waiting in the recovery file under `data_dir`, without consuming them.
    pub fn pending(data_dir: &Path) -> Result<Vec<Task>> {
        TaskLog::new(data_dir.join(paths::RECOVERY_FILE)).read()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TrackrError::Shutdown);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------------

    /// Queue a task. Failures surface only in the log.
    pub fn submit(&self, task: Task) -> Result<()> {
        self.ensure_open()?;
        tracing::debug!(task = %task, "submitted");
        self.queue.push(task);
        Ok(())
    }

    /// Queue a task and wait for its result, bounded by `wait_timeout`.
    pub fn submit_and_wait(&self, task: Task) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let id = task.id();
        let reply = self.pool.expect_reply(id);
        self.queue.push(task);
        match reply.recv_timeout(self.config.wait_timeout()) {
            Ok(result) => result.map(TaskOutput::into_rows),
            Err(RecvTimeoutError::Timeout) => {
                self.pool.cancel_reply(id);
                Err(TrackrError::WaitTimeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(TrackrError::Shutdown),
        }
    }

    /// Run a task on the calling thread, bypassing the queue.
    pub fn execute_now(&self, task: Task) -> Result<TaskOutput> {
        self.ensure_open()?;
        self.executor.execute(&task)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn list_objects(&self) -> BTreeSet<String> {
        self.registry.list()
    }

    /// System fields first, then the declared fields.
    pub fn object_schema(&self, name: &str) -> Result<Vec<FieldDef>> {
        Ok(self.registry.lookup(name)?.schema().all_fields())
    }

    pub fn object_info(&self, name: &str) -> Result<ObjectInfo> {
        Ok(self.registry.lookup(name)?.info())
    }

    pub fn objects_info(&self) -> Vec<ObjectInfo> {
        self.registry.objects().iter().map(|o| o.info()).collect()
    }

    pub fn recent_activity(&self) -> Vec<RecentEntry> {
        self.recent.snapshot()
    }

    pub fn queued(&self) -> usize {
        self.queue.size()
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stop the pool and persist whatever is still queued. Returns the number
    /// of tasks written to the recovery file. Idempotent.
    pub fn shutdown(&self) -> Result<usize> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        self.pool.shutdown();
        self.queue.close_gate();
        let remaining = self.queue.snapshot();
        if remaining.is_empty() {
            self.log.delete()?;
            tracing::info!("engine stopped");
            return Ok(0);
        }
        self.log.write(&remaining)?;
        tracing::info!(
            count = remaining.len(),
            path = %self.log.path().display(),
            "engine stopped; remaining tasks saved"
        );
        Ok(remaining.len())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::schema::FieldType;
    use crate::task::{Query, Selection, TaskKind};
    use serde_json::json;
    use tempfile::TempDir;

    fn fast_config() -> Config {
        Config {
            storage: StorageBackend::Memory,
            pool: PoolConfig {
                workers: 2,
                stuck_timeout_ms: 2000,
                idle_poll_ms: 10,
                busy_poll_ms: 5,
            },
            wait_timeout_ms: 5000,
            ..Config::default()
        }
    }

    fn record(v: serde_json::Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn submit_then_select_through_the_pool() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), fast_config()).unwrap();
        engine
            .execute_now(Task::create(
                "logins",
                vec![FieldDef::new("status", FieldType::Text)],
                Some("logins"),
            ))
            .unwrap();
        engine
            .submit(Task::insert("logins", record(json!({"status": "ok"}))))
            .unwrap();
        assert!(engine.wait_idle(Duration::from_secs(5)));

        let rows = engine
            .submit_and_wait(Task::select("logins", Selection::new(Query::all())))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(engine.object_info("logins").unwrap().row_count, Some(1));
        assert_eq!(engine.recent_activity().len(), 1);
        engine.shutdown().unwrap();
    }

    #[test]
    fn select_errors_surface_synchronously() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), fast_config()).unwrap();
        let err = engine
            .submit_and_wait(Task::select("ghost", Selection::default()))
            .unwrap_err();
        assert!(matches!(err, TrackrError::UnknownObject(_)));
    }

    #[test]
    fn schema_lists_system_fields_first() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), fast_config()).unwrap();
        let names: Vec<String> = engine
            .object_schema("_alert_rules")
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(&names[..3], &["_id", "_timestamp_created", "_timestamp_modified"]);
        assert!(names.contains(&"column_value".to_string()));
    }

    #[test]
    fn closed_engine_rejects_work() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), fast_config()).unwrap();
        assert_eq!(engine.shutdown().unwrap(), 0);
        assert!(matches!(
            engine.submit(Task::drop("logins")),
            Err(TrackrError::Shutdown)
        ));
        assert_eq!(engine.shutdown().unwrap(), 0);
    }

    #[test]
    fn recovered_tasks_are_queued_ahead_of_reflection_counts() {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first = Engine::assemble(dir.path(), &fast_config(), Arc::clone(&storage)).unwrap();
        assert!(first.queue.is_empty());

        let saved = Task::drop("logins");
        TaskLog::new(dir.path().join(paths::RECOVERY_FILE))
            .write(&[saved.clone()])
            .unwrap();

        let parts = Engine::assemble(dir.path(), &fast_config(), storage).unwrap();
        let queued = parts.queue.snapshot();
        assert_eq!(queued.len(), 5);
        assert_eq!(queued[0].id(), saved.id());
        assert!(queued[1..].iter().all(|t| t.kind() == TaskKind::UpdateCount));
        assert!(!parts.log.exists());
    }
}

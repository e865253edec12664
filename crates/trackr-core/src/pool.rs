//! Fixed-size worker pool fed by the task queue.
//!
//! One dispatcher thread pops tasks in FIFO order and hands each to the first
//! idle worker. Each worker owns at most one task at a time and runs it
//! through a [`TaskRunner`]. A worker busy on the same task for longer than
//! `stuck_timeout` is abandoned (its thread keeps running and exits once its
//! task returns), a replacement is spawned and the task is re-assigned to it.

use crate::config::PoolConfig;
use crate::error::{Result, TrackrError};
use crate::queue::TaskQueue;
use crate::schema::Record;
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Runner seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Done,
    Rows(Vec<Record>),
}

impl TaskOutput {
    pub fn into_rows(self) -> Vec<Record> {
        match self {
            TaskOutput::Done => Vec::new(),
            TaskOutput::Rows(rows) => rows,
        }
    }
}

/// Executes one task on a worker thread.
pub trait TaskRunner: Send + Sync + 'static {
    fn run(&self, task: &Task) -> Result<TaskOutput>;
}

type Reply = Sender<Result<TaskOutput>>;

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Assignment {
    task: Task,
    assigned_at: Instant,
}

#[derive(Debug, Default)]
struct SlotState {
    current: Option<Assignment>,
    exit: bool,
    abandoned: bool,
}

/// Shared between a worker thread and the dispatcher.
#[derive(Debug)]
struct Slot {
    name: String,
    state: Mutex<SlotState>,
    wake: Condvar,
}

impl Slot {
    fn is_busy(&self) -> bool {
        self.state.lock().current.is_some()
    }
}

struct Worker {
    slot: Arc<Slot>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    active: Vec<Worker>,
    abandoned: Vec<Worker>,
    next_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub busy: usize,
    pub abandoned: usize,
    pub completed: u64,
    pub failed: u64,
}

struct Shared<R> {
    runner: Arc<R>,
    queue: Arc<TaskQueue>,
    config: PoolConfig,
    workers: Mutex<Workers>,
    replies: Mutex<HashMap<Uuid, Reply>>,
    shutting_down: AtomicBool,
    /// True while the dispatcher holds a popped task it has not assigned.
    holding: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl<R: TaskRunner> Shared<R> {
    fn spawn_worker(self: &Arc<Self>, workers: &mut Workers, task: Option<Task>) -> Result<Worker> {
        workers.next_id += 1;
        let slot = Arc::new(Slot {
            name: format!("worker-{}", workers.next_id),
            state: Mutex::new(SlotState {
                current: task.map(|task| Assignment {
                    task,
                    assigned_at: Instant::now(),
                }),
                ..SlotState::default()
            }),
            wake: Condvar::new(),
        });
        let shared = Arc::clone(self);
        let thread_slot = Arc::clone(&slot);
        let handle = thread::Builder::new()
            .name(slot.name.clone())
            .spawn(move || shared.worker_loop(&thread_slot))?;
        tracing::debug!(worker = %slot.name, "worker started");
        Ok(Worker { slot, handle })
    }

    fn worker_loop(&self, slot: &Slot) {
        loop {
            let task = {
                let mut state = slot.state.lock();
                loop {
                    if let Some(assignment) = &state.current {
                        break assignment.task.clone();
                    }
                    if state.exit || state.abandoned {
                        tracing::debug!(worker = %slot.name, "worker exiting");
                        return;
                    }
                    slot.wake.wait(&mut state);
                }
            };

            tracing::debug!(worker = %slot.name, task = %task, "running task");
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.runner.run(&task)))
                .unwrap_or_else(|_| Err(TrackrError::Storage(format!("task {task} panicked"))));
            self.finish(&slot.name, &task, result);

            let mut state = slot.state.lock();
            if state
                .current
                .as_ref()
                .is_some_and(|a| a.task.id() == task.id())
            {
                state.current = None;
            }
            if state.abandoned {
                tracing::info!(worker = %slot.name, task = %task, "abandoned worker finished its task");
                return;
            }
        }
    }

    fn finish(&self, worker: &str, task: &Task, result: Result<TaskOutput>) {
        match &result {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = %worker, task = %task, error = %e, "task failed");
            }
        }
        if let Some(reply) = self.replies.lock().remove(&task.id()) {
            let _ = reply.send(result);
        }
    }

    /// Hand `task` to the first idle active worker, or give it back.
    fn try_assign(&self, task: Task) -> std::result::Result<(), Task> {
        let workers = self.workers.lock();
        for worker in &workers.active {
            let mut state = worker.slot.state.lock();
            if state.current.is_none() {
                tracing::debug!(worker = %worker.slot.name, task = %task, "assigned");
                state.current = Some(Assignment {
                    task,
                    assigned_at: Instant::now(),
                });
                worker.slot.wake.notify_one();
                return Ok(());
            }
        }
        Err(task)
    }

    /// Replace every active worker that has held its task past the timeout.
    fn replace_stuck(self: &Arc<Self>) {
        let timeout = self.config.stuck_timeout();
        let mut workers = self.workers.lock();
        let mut i = 0;
        while i < workers.active.len() {
            let stuck = {
                let mut state = workers.active[i].slot.state.lock();
                let stuck = state
                    .current
                    .as_ref()
                    .filter(|a| a.assigned_at.elapsed() > timeout)
                    .map(|a| a.task.clone());
                if stuck.is_some() {
                    state.abandoned = true;
                }
                stuck
            };
            if let Some(task) = stuck {
                let old = workers.active[i].slot.name.clone();
                match self.spawn_worker(&mut workers, Some(task.clone())) {
                    Ok(replacement) => {
                        tracing::warn!(
                            worker = %old,
                            replacement = %replacement.slot.name,
                            task = %task,
                            "worker stuck; task reassigned"
                        );
                        let stale = std::mem::replace(&mut workers.active[i], replacement);
                        workers.abandoned.push(stale);
                    }
                    Err(e) => {
                        workers.active[i].slot.state.lock().abandoned = false;
                        tracing::error!(worker = %old, error = %e, "could not spawn replacement worker");
                    }
                }
            }
            i += 1;
        }
    }

    fn dispatch_loop(self: &Arc<Self>) {
        let idle_poll = self.config.idle_poll();
        let busy_poll = self.config.busy_poll();
        let mut pending: Option<Task> = None;

        while !self.shutting_down.load(Ordering::SeqCst) {
            if pending.is_none() {
                if !self.queue.wait_for_task(idle_poll) {
                    self.replace_stuck();
                    continue;
                }
                self.holding.store(true, Ordering::SeqCst);
                pending = self.queue.pop();
                if pending.is_none() {
                    self.holding.store(false, Ordering::SeqCst);
                    self.replace_stuck();
                    continue;
                }
            }
            if let Some(task) = pending.take() {
                match self.try_assign(task) {
                    Ok(()) => {
                        self.holding.store(false, Ordering::SeqCst);
                        self.replace_stuck();
                    }
                    Err(task) => {
                        pending = Some(task);
                        self.replace_stuck();
                        thread::sleep(busy_poll);
                    }
                }
            }
        }

        if let Some(task) = pending {
            tracing::debug!(task = %task, "returning unassigned task to queue");
            self.queue.push_front(task);
        }
        self.holding.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool<R: TaskRunner> {
    shared: Arc<Shared<R>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<R: TaskRunner> WorkerPool<R> {
    /// Spawn `config.workers` workers and the dispatcher.
    pub fn start(runner: Arc<R>, queue: Arc<TaskQueue>, config: PoolConfig) -> Result<Self> {
        let size = config.workers.max(1);
        let shared = Arc::new(Shared {
            runner,
            queue,
            config,
            workers: Mutex::new(Workers::default()),
            replies: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            holding: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        {
            let mut workers = shared.workers.lock();
            for _ in 0..size {
                let worker = shared.spawn_worker(&mut workers, None)?;
                workers.active.push(worker);
            }
        }
        let dispatch_shared = Arc::clone(&shared);
        let dispatcher = thread::Builder::new()
            .name("trackr-dispatch".to_string())
            .spawn(move || dispatch_loop_entry(dispatch_shared))?;
        tracing::info!(workers = size, "worker pool started");
        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Register interest in the result of task `id`. Must be called before
    /// the task is pushed. The sender is dropped at shutdown.
    pub fn expect_reply(&self, id: Uuid) -> Receiver<Result<TaskOutput>> {
        let (tx, rx) = mpsc::channel();
        self.shared.replies.lock().insert(id, tx);
        rx
    }

    pub fn cancel_reply(&self, id: Uuid) {
        self.shared.replies.lock().remove(&id);
    }

    /// Wait until the queue is empty and no worker is busy.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn is_idle(&self) -> bool {
        if !self.shared.queue.is_empty() || self.shared.holding.load(Ordering::SeqCst) {
            return false;
        }
        let workers = self.shared.workers.lock();
        !workers.active.iter().any(|w| w.slot.is_busy())
    }

    pub fn stats(&self) -> PoolStats {
        let workers = self.shared.workers.lock();
        PoolStats {
            active: workers.active.len(),
            busy: workers.active.iter().filter(|w| w.slot.is_busy()).count(),
            abandoned: workers.abandoned.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop dispatching, let active workers finish their current task and
    /// join them. Abandoned workers get a bounded wait; any still running
    /// after it are detached. Idempotent.
    pub fn shutdown(&self) {
        let Some(dispatcher) = self.dispatcher.lock().take() else {
            return;
        };
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        if dispatcher.join().is_err() {
            tracing::error!("dispatcher thread panicked");
        }

        let active = {
            let mut workers = self.shared.workers.lock();
            std::mem::take(&mut workers.active)
        };
        for worker in &active {
            worker.slot.state.lock().exit = true;
            worker.slot.wake.notify_one();
        }
        for worker in active {
            let name = worker.slot.name.clone();
            if worker.handle.join().is_err() {
                tracing::error!(worker = %name, "worker thread panicked");
            }
        }

        // Abandoned workers can still queue follow-up tasks (alert finds).
        // Give them up to one stuck timeout so those land before the caller
        // snapshots the queue.
        let abandoned = std::mem::take(&mut self.shared.workers.lock().abandoned);
        let deadline = Instant::now() + self.shared.config.stuck_timeout();
        let mut lingering = 0;
        for worker in abandoned {
            while !worker.handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if worker.handle.is_finished() {
                if worker.handle.join().is_err() {
                    tracing::error!(worker = %worker.slot.name, "worker thread panicked");
                }
            } else {
                tracing::warn!(worker = %worker.slot.name, "abandoned worker still running at shutdown");
                lingering += 1;
            }
        }

        self.shared.replies.lock().clear();
        tracing::info!(lingering, "worker pool stopped");
    }
}

fn dispatch_loop_entry<R: TaskRunner>(shared: Arc<Shared<R>>) {
    shared.dispatch_loop();
}

impl<R: TaskRunner> Drop for WorkerPool<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    /// Records the order tasks ran in. The first task targeting "Slow"
    /// sleeps for `slow`.
    #[derive(Default)]
    struct Recorder {
        ran: Mutex<Vec<String>>,
        slow: Duration,
        slowed: AtomicBool,
    }

    impl TaskRunner for Recorder {
        fn run(&self, task: &Task) -> Result<TaskOutput> {
            if task.target() == "Slow" && !self.slowed.swap(true, Ordering::SeqCst) {
                thread::sleep(self.slow);
            }
            if task.target() == "Fail" {
                return Err(TrackrError::InvalidRecord("boom".into()));
            }
            self.ran.lock().push(task.target().to_string());
            Ok(match task.kind() {
                TaskKind::Select => TaskOutput::Rows(vec![Record::new()]),
                _ => TaskOutput::Done,
            })
        }
    }

    fn fast_config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            stuck_timeout_ms: 200,
            idle_poll_ms: 10,
            busy_poll_ms: 5,
        }
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let runner = Arc::new(Recorder::default());
        let queue = Arc::new(TaskQueue::new());
        let pool = WorkerPool::start(Arc::clone(&runner), Arc::clone(&queue), fast_config(1)).unwrap();
        for name in ["a", "b", "c", "d"] {
            queue.push(Task::drop(name));
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(*runner.ran.lock(), vec!["A", "B", "C", "D"]);
        pool.shutdown();
    }

    #[test]
    fn failures_do_not_kill_workers() {
        let runner = Arc::new(Recorder::default());
        let queue = Arc::new(TaskQueue::new());
        let pool = WorkerPool::start(Arc::clone(&runner), Arc::clone(&queue), fast_config(1)).unwrap();
        queue.push(Task::drop("fail"));
        queue.push(Task::drop("after"));
        assert!(pool.wait_idle(Duration::from_secs(5)));
        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(*runner.ran.lock(), vec!["After"]);
    }

    #[test]
    fn reply_is_delivered_to_waiter() {
        let runner = Arc::new(Recorder::default());
        let queue = Arc::new(TaskQueue::new());
        let pool = WorkerPool::start(runner, Arc::clone(&queue), fast_config(2)).unwrap();
        let task = Task::select("logins", Default::default());
        let rx = pool.expect_reply(task.id());
        queue.push(task);
        let out = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(out.into_rows().len(), 1);
    }

    #[test]
    fn stuck_worker_is_replaced_and_task_reassigned() {
        let runner = Arc::new(Recorder {
            slow: Duration::from_millis(600),
            ..Recorder::default()
        });
        let queue = Arc::new(TaskQueue::new());
        let pool = WorkerPool::start(Arc::clone(&runner), Arc::clone(&queue), fast_config(1)).unwrap();
        queue.push(Task::drop("slow"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().abandoned == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = pool.stats();
        assert!(stats.abandoned >= 1);
        assert_eq!(stats.active, 1);

        // Work keeps flowing on the replacement once the slow task is done.
        queue.push(Task::drop("next"));
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert!(runner.ran.lock().contains(&"Next".to_string()));
    }

    /// Runs the first task slowly and then queues a follow-up, like an
    /// insert that matched an alert rule.
    struct FollowUp {
        queue: Arc<TaskQueue>,
        slow: Duration,
        slowed: AtomicBool,
    }

    impl TaskRunner for FollowUp {
        fn run(&self, _task: &Task) -> Result<TaskOutput> {
            if !self.slowed.swap(true, Ordering::SeqCst) {
                thread::sleep(self.slow);
                self.queue.push(Task::update_count("followup"));
            }
            Ok(TaskOutput::Done)
        }
    }

    #[test]
    fn shutdown_waits_for_abandoned_worker_follow_ups() {
        let queue = Arc::new(TaskQueue::new());
        let runner = Arc::new(FollowUp {
            queue: Arc::clone(&queue),
            slow: Duration::from_millis(300),
            slowed: AtomicBool::new(false),
        });
        let pool = WorkerPool::start(runner, Arc::clone(&queue), fast_config(1)).unwrap();
        queue.push(Task::insert("logins", Record::new()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().abandoned == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.stats().abandoned, 1);
        pool.shutdown();

        assert_eq!(pool.stats().abandoned, 0);
        let left: Vec<String> = queue.snapshot().iter().map(|t| t.target().to_string()).collect();
        assert_eq!(left, vec!["Followup"]);
    }

    #[test]
    fn shutdown_leaves_unstarted_tasks_queued() {
        let runner = Arc::new(Recorder {
            slow: Duration::from_millis(100),
            ..Recorder::default()
        });
        let queue = Arc::new(TaskQueue::new());
        let pool = WorkerPool::start(Arc::clone(&runner), Arc::clone(&queue), fast_config(1)).unwrap();
        queue.push(Task::drop("slow"));
        thread::sleep(Duration::from_millis(30));
        for name in ["x", "y", "z"] {
            queue.push(Task::drop(name));
        }
        pool.shutdown();
        pool.shutdown();

        let ran = runner.ran.lock().clone();
        let left: Vec<String> = queue.snapshot().iter().map(|t| t.target().to_string()).collect();
        assert_eq!(ran.len() + left.len(), 4);
        // Whatever was not run is still queued in submission order.
        let expected: Vec<String> = ["Slow", "X", "Y", "Z"]
            .iter()
            .map(|s| s.to_string())
            .filter(|s| !ran.contains(s))
            .collect();
        assert_eq!(left, expected);
    }
}

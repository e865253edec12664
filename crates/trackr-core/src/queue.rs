use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct QueueState {
    tasks: VecDeque<Task>,
    poppable: bool,
}

/// FIFO buffer shared by producers and the dispatcher.
///
/// Once the gate is closed nothing more can be popped, but pushes are still
/// accepted so that late follow-up tasks end up in the shutdown snapshot.
#[derive(Debug)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                poppable: true,
            }),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, task: Task) {
        self.state.lock().tasks.push_back(task);
        self.available.notify_one();
    }

    /// Return a popped task to the head of the queue.
    pub fn push_front(&self, task: Task) {
        self.state.lock().tasks.push_front(task);
        self.available.notify_one();
    }

    /// Remove the oldest task. Never blocks; `None` when empty or gated.
    pub fn pop(&self) -> Option<Task> {
        let mut state = self.state.lock();
        if !state.poppable {
            return None;
        }
        state.tasks.pop_front()
    }

    pub fn size(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn close_gate(&self) {
        self.state.lock().poppable = false;
        self.available.notify_all();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().poppable
    }

    /// Copy of the queued tasks, oldest first.
    pub fn snapshot(&self) -> Vec<Task> {
        self.state.lock().tasks.iter().cloned().collect()
    }

    /// Block until the queue is non-empty, the gate closes, or `timeout`
    /// elapses. Returns whether a task is waiting.
    pub fn wait_for_task(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.tasks.is_empty() && state.poppable {
            if self.available.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        !state.tasks.is_empty()
    }
}

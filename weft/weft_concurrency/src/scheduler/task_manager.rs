//! Dependency-aware task scheduling.
//!
//! A `TaskManager` keeps one queue of tasks split at `first_pending`: tasks
//! before the cursor are claimed by a worker (running or about to run), tasks
//! from the cursor on are waiting. A worker claims the earliest waiting task
//! whose `run_after` constraint is not blocked by anything ahead of it, moves
//! that task to the cursor and advances the cursor. Tasks without
//! constraints therefore start in submission order, and a constrained task
//! never starts ahead of, or alongside, the tasks it depends on.
//!
//! Workers are dedicated threads, started when the number of runnable tasks
//! outgrows `load_factor` tasks per worker and retired after sitting idle.

use crate::interrupt::InterruptFlag;
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use weft_core::error::{panic_message, ConcurrencyError, Fatal, Result};
use weft_core::traits::task::same_task;
use weft_core::traits::TaskRef;
use weft_core::utils::duration_ms;

/// Configuration for a task manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Name prefix for worker threads
    pub name: String,

    /// Maximum number of worker threads
    pub max_threads: usize,

    /// How long an idle worker waits for a claimable task before exiting
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Runnable tasks per worker tolerated before another worker is started
    pub load_factor: f32,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            name: "weft-task".to_string(),
            max_threads: 10,
            idle_timeout: Duration::from_secs(15),
            load_factor: 3.0,
        }
    }
}

/// Bookkeeping for one worker thread
struct WorkerSlot {
    id: u64,
    thread: ThreadId,
    /// Task currently claimed by this worker
    task: Option<TaskRef>,
    interrupt: InterruptFlag,
}

/// Queue and worker set, guarded by the manager's lock
struct ManagerState {
    tasks: Vec<TaskRef>,
    first_pending: usize,
    workers: Vec<WorkerSlot>,
    terminated: bool,
    next_worker_id: u64,
}

impl ManagerState {
    /// Evaluate the ordering constraint of the task at `index` against
    /// everything queued ahead of it
    fn run_after(&self, index: usize) -> bool {
        let task = &self.tasks[index];
        let preceding = &self.tasks[..index];
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            task.run_after(preceding)
        })) {
            Ok(blocked) => blocked,
            Err(payload) => {
                warn!(
                    "Task '{}' panicked in run_after: {}",
                    task.name(),
                    panic_message(payload.as_ref())
                );
                false
            }
        }
    }

    /// Whether the queue justifies another worker.
    ///
    /// Counts claimed tasks plus waiting tasks that could run now, stopping
    /// as soon as the count exceeds `load_factor` per existing worker.
    fn need_thread(&self, load_factor: f32) -> bool {
        let bound = (load_factor * self.workers.len() as f32) as usize;
        let mut max = self.tasks.len();
        if max < bound {
            return false;
        }
        max -= 1;
        if self.run_after(max) {
            return false;
        }
        let mut ready = self.first_pending + 1;
        if ready > bound {
            return true;
        }
        for i in self.first_pending..max {
            if !self.run_after(i) {
                ready += 1;
                if ready > bound {
                    return true;
                }
            }
        }
        false
    }

    /// Claim the earliest waiting task that is not blocked
    fn take_task(&mut self) -> Option<TaskRef> {
        for i in self.first_pending..self.tasks.len() {
            if !self.run_after(i) {
                // move the task to the cursor, keeping the order of the
                // tasks it jumps over
                self.tasks[self.first_pending..=i].rotate_right(1);
                let task = Arc::clone(&self.tasks[self.first_pending]);
                self.first_pending += 1;
                return Some(task);
            }
        }
        None
    }

    /// Take a finished task out of the claimed prefix
    fn finish(&mut self, worker: u64, task: &TaskRef) -> Option<TaskRef> {
        if let Some(slot) = self.workers.iter_mut().find(|w| w.id == worker) {
            slot.task = None;
        }
        let index = self.tasks[..self.first_pending]
            .iter()
            .rposition(|t| same_task(t, task))?;
        self.first_pending -= 1;
        Some(self.tasks.remove(index))
    }

    fn remove_pending(&mut self, task: &TaskRef) -> bool {
        let found = self.tasks[self.first_pending..]
            .iter()
            .position(|t| same_task(t, task));
        match found {
            Some(offset) => {
                self.tasks.remove(self.first_pending + offset);
                true
            }
            None => false,
        }
    }

    fn deregister(&mut self, worker: u64) {
        self.workers.retain(|w| w.id != worker);
    }
}

/// State shared between the manager handle and its workers
struct ManagerShared {
    state: Mutex<ManagerState>,
    /// Signalled when a task may have become claimable or on termination
    available: Condvar,
    config: TaskManagerConfig,
}

/// Queue of tasks with ordering constraints, run by dedicated workers.
pub struct TaskManager {
    shared: Arc<ManagerShared>,
}

impl TaskManager {
    /// Create a new task manager with the default configuration
    pub fn new() -> Self {
        Self::with_config(TaskManagerConfig::default())
    }

    /// Create a new task manager with the specified configuration
    pub fn with_config(mut config: TaskManagerConfig) -> Self {
        if config.max_threads == 0 {
            warn!(
                "Task manager '{}': max_threads must be at least 1, using 1",
                config.name
            );
            config.max_threads = 1;
        }
        if !config.load_factor.is_finite() || config.load_factor <= 0.0 {
            let fallback = TaskManagerConfig::default().load_factor;
            warn!(
                "Task manager '{}': invalid load factor {}, using {}",
                config.name, config.load_factor, fallback
            );
            config.load_factor = fallback;
        }
        info!(
            "Creating task manager '{}' (max {} threads, idle timeout {:?}, load factor {})",
            config.name, config.max_threads, config.idle_timeout, config.load_factor
        );

        Self {
            shared: Arc::new(ManagerShared {
                state: Mutex::new(ManagerState {
                    tasks: Vec::new(),
                    first_pending: 0,
                    workers: Vec::new(),
                    terminated: false,
                    next_worker_id: 0,
                }),
                available: Condvar::new(),
                config,
            }),
        }
    }

    /// Queue a task
    pub fn add(&self, task: TaskRef) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.terminated {
            return Err(ConcurrencyError::Terminated.into());
        }
        self.push(&mut state, task);
        Ok(())
    }

    /// Queue a task unless the same or an equivalent task is already queued,
    /// claimed or waiting. Returns whether the task was added.
    pub fn add_if_new(&self, task: TaskRef) -> Result<bool> {
        let mut state = self.shared.state.lock();
        if state.terminated {
            return Err(ConcurrencyError::Terminated.into());
        }
        let duplicate = state
            .tasks
            .iter()
            .any(|t| same_task(t, &task) || task.equivalent(t.as_ref()));
        if duplicate {
            trace!("Task '{}' already queued", task.name());
            return Ok(false);
        }
        self.push(&mut state, task);
        Ok(true)
    }

    /// Queue several tasks, in order
    pub fn add_all<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = TaskRef>,
    {
        let mut state = self.shared.state.lock();
        if state.terminated {
            return Err(ConcurrencyError::Terminated.into());
        }
        for task in tasks {
            self.push(&mut state, task);
        }
        Ok(())
    }

    /// Append a task and provision or wake workers for it
    fn push(&self, state: &mut MutexGuard<'_, ManagerState>, task: TaskRef) {
        trace!("Queued task '{}'", task.name());
        state.tasks.push(task);

        let mut poke = true;
        while state.workers.len() < self.shared.config.max_threads
            && state.need_thread(self.shared.config.load_factor)
        {
            match Self::spawn_worker(&self.shared, state) {
                Ok(()) => poke = false,
                Err(e) => {
                    if state.workers.is_empty() {
                        error!(
                            "Task manager '{}' cannot start any worker: {}",
                            self.shared.config.name, e
                        );
                    } else {
                        warn!(
                            "Task manager '{}' failed to start an extra worker: {}",
                            self.shared.config.name, e
                        );
                    }
                    break;
                }
            }
        }

        let last = state.tasks.len() - 1;
        if poke && state.workers.len() > state.first_pending && !state.run_after(last) {
            self.shared.available.notify_one();
        }
    }

    /// Start a worker thread and register it; the caller holds the lock
    fn spawn_worker(
        shared: &Arc<ManagerShared>,
        state: &mut ManagerState,
    ) -> std::io::Result<()> {
        let id = state.next_worker_id;
        state.next_worker_id += 1;

        let interrupt = InterruptFlag::new();
        let worker_interrupt = interrupt.clone();
        let worker_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", shared.config.name, id))
            .spawn(move || Self::worker_loop(worker_shared, id, worker_interrupt))?;

        // the worker blocks on the lock we hold until it is registered
        state.workers.push(WorkerSlot {
            id,
            thread: handle.thread().id(),
            task: None,
            interrupt,
        });
        debug!(
            "Task manager '{}': Started worker {} ({} live)",
            shared.config.name,
            id,
            state.workers.len()
        );
        Ok(())
    }

    /// Worker thread main loop
    fn worker_loop(shared: Arc<ManagerShared>, id: u64, interrupt: InterruptFlag) {
        interrupt.install();

        let mut state = shared.state.lock();
        loop {
            if state.terminated {
                break;
            }

            // a cancellation aimed at the previous task must not leak
            interrupt.clear();

            let task = match state.take_task() {
                Some(task) => task,
                None => match Self::wait_for_task(&shared, &mut state) {
                    Some(task) => task,
                    None => break,
                },
            };

            if let Some(slot) = state.workers.iter_mut().find(|w| w.id == id) {
                slot.task = Some(Arc::clone(&task));
            }

            let result = MutexGuard::unlocked(&mut state, || {
                trace!("Worker {}: Running task '{}'", id, task.name());
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run()))
            });

            let finished = state.finish(id, &task);
            if state.first_pending < state.tasks.len() {
                shared.available.notify_one();
            }

            if let Err(payload) = result {
                if Fatal::is_fatal(payload.as_ref()) {
                    state.deregister(id);
                    drop(state);
                    error!(
                        "Worker {}: Task '{}' failed fatally: {}",
                        id,
                        task.name(),
                        panic_message(payload.as_ref())
                    );
                    std::panic::resume_unwind(payload);
                }
                warn!(
                    "Worker {}: Task '{}' panicked: {}",
                    id,
                    task.name(),
                    panic_message(payload.as_ref())
                );
            }

            // a task may hold the last handle to this manager, whose drop locks
            MutexGuard::unlocked(&mut state, move || drop((task, finished)));
        }

        state.deregister(id);
        debug!(
            "Task manager '{}': Worker {} exiting ({} live)",
            shared.config.name,
            id,
            state.workers.len()
        );
    }

    /// Wait up to the idle timeout for a claimable task
    fn wait_for_task(
        shared: &ManagerShared,
        state: &mut MutexGuard<'_, ManagerState>,
    ) -> Option<TaskRef> {
        let deadline = Instant::now() + shared.config.idle_timeout;
        loop {
            shared.available.wait_until(state, deadline);
            if state.terminated {
                return None;
            }
            if let Some(task) = state.take_task() {
                return Some(task);
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    /// Remove a task that has not been claimed yet. Returns whether it was
    /// found waiting.
    pub fn remove_if_pending(&self, task: &TaskRef) -> bool {
        self.shared.state.lock().remove_pending(task)
    }

    /// Remove a task whether waiting or claimed.
    ///
    /// If the task is running on another thread, that worker is interrupted;
    /// the task keeps running until it notices. Returns whether the task was
    /// queued.
    pub fn remove(&self, task: &TaskRef) -> bool {
        let mut state = self.shared.state.lock();
        if state.remove_pending(task) {
            return true;
        }

        let first_pending = state.first_pending;
        let Some(index) = state.tasks[..first_pending]
            .iter()
            .rposition(|t| same_task(t, task))
        else {
            return false;
        };

        let current = thread::current().id();
        let running = state
            .workers
            .iter()
            .find(|w| w.task.as_ref().is_some_and(|t| same_task(t, task)));
        if let Some(worker) = running {
            if worker.thread != current {
                debug!("Interrupting worker {} for task '{}'", worker.id, task.name());
                worker.interrupt.interrupt();
            }
        }

        state.tasks.remove(index);
        state.first_pending -= 1;
        true
    }

    /// Stop scheduling: interrupt every worker and refuse new tasks.
    ///
    /// Waiting tasks stay queued and are still reported by `pending`.
    pub fn terminate(&self) {
        let mut state = self.shared.state.lock();
        if state.terminated {
            return;
        }
        info!("Terminating task manager '{}'", self.shared.config.name);
        state.terminated = true;
        for worker in &state.workers {
            worker.interrupt.interrupt();
        }
        self.shared.available.notify_all();
    }

    /// Snapshot of the tasks not yet claimed by a worker
    pub fn pending(&self) -> Vec<TaskRef> {
        let state = self.shared.state.lock();
        state.tasks[state.first_pending..].to_vec()
    }

    /// Maximum number of worker threads
    pub fn max_threads(&self) -> usize {
        self.shared.config.max_threads
    }

    /// Number of live worker threads
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    /// Number of claimed tasks
    pub fn active_count(&self) -> usize {
        self.shared.state.lock().first_pending
    }

    /// Whether `terminate` has been called
    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminated
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.terminate();
    }
}

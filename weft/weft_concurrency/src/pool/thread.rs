//! Elastic thread pool for fire-and-forget work.
//!
//! Submission never blocks: a job goes to an idle worker when one is
//! available, otherwise a new worker thread is started for it. There is no
//! upper bound on the number of workers and no queue backpressure. Workers
//! that stay idle longer than the configured timeout exit.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use weft_core::error::{panic_message, Fatal};
use weft_core::utils::duration_ms;

/// Error when submitting a job to the thread pool
#[derive(Error, Debug)]
pub enum ThreadPoolError {
    /// The thread pool is shutting down
    #[error("thread pool is shutting down")]
    ShuttingDown,

    /// No idle worker was available and a new one could not be started
    #[error("failed to spawn pool worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Statistics about the thread pool
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThreadPoolStats {
    /// Number of jobs accepted by `execute`
    pub jobs_submitted: usize,

    /// Number of jobs that ran to completion
    pub jobs_completed: usize,

    /// Number of jobs that panicked
    pub jobs_panicked: usize,

    /// Number of worker threads started over the pool's lifetime
    pub workers_spawned: usize,

    /// Total time jobs spent waiting for a worker (microseconds)
    pub total_queue_time_us: u64,

    /// Maximum job execution time (microseconds)
    pub max_execution_time_us: u64,
}

/// Configuration for the thread pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Name prefix for worker threads
    pub thread_name_prefix: String,

    /// How long a worker waits for new work before exiting
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "weft-pool".to_string(),
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Job with metadata for tracking
struct Job {
    /// The closure to execute
    func: Box<dyn FnOnce() + Send + 'static>,

    /// Name used in log output
    name: String,

    /// When the job was submitted
    enqueued_at: Instant,
}

impl Job {
    fn new<F>(f: F, name: &str) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            func: Box::new(f),
            name: name.to_string(),
            enqueued_at: Instant::now(),
        }
    }
}

/// Hand-off state, guarded by the pool's lock
struct PoolState {
    /// Workers currently waiting for a job
    idle: usize,

    /// Sending side of the hand-off channel; `None` once shut down
    sender: Option<Sender<Job>>,
}

/// State shared between the pool handle and its workers
struct PoolShared {
    state: Mutex<PoolState>,
    receiver: Receiver<Job>,
    config: ThreadPoolConfig,
    is_shutting_down: AtomicBool,
    live_workers: AtomicUsize,
    next_worker_id: AtomicUsize,
    jobs_submitted: AtomicUsize,
    jobs_completed: AtomicUsize,
    jobs_panicked: AtomicUsize,
    workers_spawned: AtomicUsize,
    total_queue_time_us: AtomicU64,
    max_execution_time_us: AtomicU64,
}

/// Elastic pool of worker threads.
///
/// Pools are ordinary values: construct one per purpose and share it by
/// reference or `Arc`.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Create a new thread pool with the default configuration
    pub fn new() -> Self {
        Self::with_config(ThreadPoolConfig::default())
    }

    /// Create a new thread pool with the specified configuration
    pub fn with_config(config: ThreadPoolConfig) -> Self {
        let (sender, receiver) = unbounded();

        info!(
            "Creating thread pool '{}' (idle timeout {:?})",
            config.thread_name_prefix, config.idle_timeout
        );

        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    idle: 0,
                    sender: Some(sender),
                }),
                receiver,
                config,
                is_shutting_down: AtomicBool::new(false),
                live_workers: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
                jobs_submitted: AtomicUsize::new(0),
                jobs_completed: AtomicUsize::new(0),
                jobs_panicked: AtomicUsize::new(0),
                workers_spawned: AtomicUsize::new(0),
                total_queue_time_us: AtomicU64::new(0),
                max_execution_time_us: AtomicU64::new(0),
            }),
        }
    }

    /// Run `f` on a pool thread, handing it to an idle worker if there is
    /// one and starting a new worker otherwise.
    ///
    /// `name` identifies the job in log output.
    pub fn execute<F>(&self, f: F, name: &str) -> Result<(), ThreadPoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.is_shutting_down.load(Ordering::SeqCst) {
            return Err(ThreadPoolError::ShuttingDown);
        }

        let job = Job::new(f, name);

        let job = {
            let mut state = self.shared.state.lock();
            let sender = state.sender.as_ref().ok_or(ThreadPoolError::ShuttingDown)?;
            if state.idle > 0 {
                // the receiver lives in `shared`, so the channel is connected
                sender
                    .send(job)
                    .map_err(|_| ThreadPoolError::ShuttingDown)?;
                state.idle -= 1;
                self.shared.jobs_submitted.fetch_add(1, Ordering::Relaxed);
                trace!("Handed job '{}' to an idle worker", name);
                return Ok(());
            }
            job
        };

        self.spawn_worker(job)?;
        self.shared.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Start a worker whose first job is `job`
    fn spawn_worker(&self, job: Job) -> Result<(), ThreadPoolError> {
        let id = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let thread_name = format!("{}-{}", self.shared.config.thread_name_prefix, id);
        let job_name = job.name.clone();
        let shared = Arc::clone(&self.shared);

        self.shared.live_workers.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(thread_name)
            .spawn(move || Self::worker_loop(id, shared, job));

        match spawned {
            Ok(_) => {
                self.shared.workers_spawned.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.shared.live_workers.fetch_sub(1, Ordering::SeqCst);
                warn!("Failed to start pool worker for job '{}': {}", job_name, e);
                Err(ThreadPoolError::Spawn(e))
            }
        }
    }

    /// Worker thread main loop
    fn worker_loop(id: usize, shared: Arc<PoolShared>, first: Job) {
        debug!("Pool worker {}: Starting", id);

        let mut next = Some(first);
        while let Some(job) = next.take() {
            Self::run_job(id, &shared, job);
            next = Self::next_job(&shared);
        }

        shared.live_workers.fetch_sub(1, Ordering::SeqCst);
        debug!("Pool worker {}: Exiting", id);
    }

    /// Run one job, containing ordinary panics
    fn run_job(id: usize, shared: &PoolShared, job: Job) {
        let queue_time = job.enqueued_at.elapsed();
        shared
            .total_queue_time_us
            .fetch_add(queue_time.as_micros() as u64, Ordering::Relaxed);

        trace!("Pool worker {}: Running job '{}'", id, job.name);

        let exec_start = Instant::now();
        let func = job.func;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(func));
        let exec_time_us = exec_start.elapsed().as_micros() as u64;
        shared
            .max_execution_time_us
            .fetch_max(exec_time_us, Ordering::Relaxed);

        match result {
            Ok(()) => {
                shared.jobs_completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) if Fatal::is_fatal(payload.as_ref()) => {
                shared.jobs_panicked.fetch_add(1, Ordering::Relaxed);
                shared.live_workers.fetch_sub(1, Ordering::SeqCst);
                warn!(
                    "Pool worker {}: Job '{}' failed fatally: {}",
                    id,
                    job.name,
                    panic_message(payload.as_ref())
                );
                std::panic::resume_unwind(payload);
            }
            Err(payload) => {
                shared.jobs_panicked.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Pool worker {}: Job '{}' panicked: {}",
                    id,
                    job.name,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Idle until a job is handed over or the timeout expires.
    ///
    /// Every job in the channel was paid for by a decrement of `idle`, so
    /// only workers counted in `idle` may receive from it.
    fn next_job(shared: &PoolShared) -> Option<Job> {
        {
            let mut state = shared.state.lock();
            if state.sender.is_none() && shared.receiver.is_empty() {
                return None;
            }
            // a hand-off takes the worker out of the idle count on its behalf
            state.idle += 1;
        }
        let received = shared.receiver.recv_timeout(shared.config.idle_timeout);

        match received {
            Ok(job) => Some(job),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                let mut state = shared.state.lock();
                // a job handed over after the timeout is already accounted for
                let late = shared.receiver.try_recv().ok();
                if late.is_none() {
                    state.idle -= 1;
                }
                late
            }
        }
    }

    /// Get current statistics for the thread pool
    pub fn stats(&self) -> ThreadPoolStats {
        ThreadPoolStats {
            jobs_submitted: self.shared.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.shared.jobs_completed.load(Ordering::Relaxed),
            jobs_panicked: self.shared.jobs_panicked.load(Ordering::Relaxed),
            workers_spawned: self.shared.workers_spawned.load(Ordering::Relaxed),
            total_queue_time_us: self.shared.total_queue_time_us.load(Ordering::Relaxed),
            max_execution_time_us: self.shared.max_execution_time_us.load(Ordering::Relaxed),
        }
    }

    /// Number of live worker threads
    pub fn worker_count(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    /// Number of workers waiting for a job
    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle
    }

    /// Refuse further jobs; idle workers exit once queued jobs are drained
    pub fn shutdown(&self) {
        if self.shared.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "Shutting down thread pool '{}'",
            self.shared.config.thread_name_prefix
        );
        // disconnecting the channel wakes every idle worker
        self.shared.state.lock().sender = None;
    }

    /// Check if the thread pool is shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down.load(Ordering::SeqCst)
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

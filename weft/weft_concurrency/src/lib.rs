#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Weft Concurrency
//!
//! Thread-based schedulers and synchronization primitives for Weft.
//!
//! This crate provides:
//!
//! - Dependency-aware task execution on dedicated workers
//! - Time-based deferred execution with cancellable tickets
//! - An elastic thread pool for fire-and-forget jobs
//! - Readers/writer locks with explicit fairness
//! - Retry with backoff layered on the schedulers
//!
//! Every component runs on OS threads guarded by a mutex and condition
//! variables. Nothing here depends on an async runtime.
//!
//! Components log through the `log` facade; installing a logger is up to
//! the application.

/// Aggregated configuration for all schedulers
pub mod config;

/// Cooperative interruption of task manager workers
pub mod interrupt;

/// Elastic thread pooling
pub mod pool;

/// Task managers, wakeup timers and retries
pub mod scheduler;

/// Readers/writer synchronization
pub mod sync;

// Re-export key types for easier access
pub use config::RuntimeConfig;
pub use pool::thread::ThreadPool;
pub use scheduler::retry::{RetryPolicy, RetryTask};
pub use scheduler::task_manager::TaskManager;
pub use scheduler::wakeup::{ThreadDesc, Ticket, WakeupManager};
pub use sync::readers_writer::{ReadersPriorityWriter, ReadersWriter};
pub use weft_core::{Error, Result, Task, TaskRef};

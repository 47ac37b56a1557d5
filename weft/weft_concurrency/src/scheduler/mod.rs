//! Task scheduling.
//!
//! This module provides the schedulers built on dedicated threads:
//!
//! - Dependency-aware task execution (`TaskManager`)
//! - Deferred execution at a point in time (`WakeupManager`)
//! - Retry with backoff layered on both (`RetryTask`)

pub mod retry;
pub mod task_manager;
pub mod wakeup;

// Re-export key types from retry
pub use retry::{default_backoff, RetryPolicy, RetryTask};

// Re-export key types from task_manager
pub use task_manager::{TaskManager, TaskManagerConfig};

// Re-export key types from wakeup
pub use wakeup::{
    ThreadDesc, Ticket, WakeupConfig, WakeupManager, MAX_PRIORITY, MIN_PRIORITY, NORM_PRIORITY,
};

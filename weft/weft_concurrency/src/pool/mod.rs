//! Thread pooling.
//!
//! An elastic pool that runs submitted closures on reusable worker threads,
//! spawning a new worker whenever none is idle.

pub mod thread;

// Re-export key types from thread
pub use thread::{ThreadPool, ThreadPoolConfig, ThreadPoolError, ThreadPoolStats};

//! # Weft Core
//!
//! `weft_core` provides the shared building blocks for the Weft concurrency
//! substrate: the error hierarchy, the capability traits implemented by units
//! of work, and small configuration helpers.
//!
//! ## Crate Structure
//!
//! - **error**: Error types for all Weft components
//! - **traits**: The `Task` and `Runnable` capabilities consumed by schedulers
//! - **utils**: Configuration and serialization helpers

pub mod error;
pub mod traits;
pub mod utils;

// Re-export key types and traits for convenience
pub use error::{ConcurrencyError, ConfigError, Error, Fatal, Result};
pub use traits::{Runnable, Task, TaskRef};

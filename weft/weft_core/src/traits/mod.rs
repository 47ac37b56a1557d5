//! Core traits for the Weft concurrency substrate.
//!
//! These traits define the capabilities that schedulers consume:
//!
//! - **Task**: a unit of work with ordering constraints, run by a task manager
//! - **Runnable**: a plain unit of work, run by timers and worker pools

pub mod task;

pub use task::{Runnable, Task, TaskRef};

//! Synchronization primitives.
//!
//! Readers/writer locks with explicit fairness rules, optionally with a
//! priority writer class that overtakes ordinary writers.

pub mod readers_writer;

// Re-export key types from readers_writer
pub use readers_writer::{Notifier, ReadGuard, ReadersPriorityWriter, ReadersWriter, WriteGuard};

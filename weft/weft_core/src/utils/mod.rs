//! Utility functions and types.
//!
//! This module provides helpers shared by the Weft crates.

pub mod config;

pub use config::{duration_ms, ensure_non_zero};

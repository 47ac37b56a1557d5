//! Error types for the Weft concurrency substrate.
//!
//! The errors are organized by concern: scheduling usage errors live in
//! `ConcurrencyError`, configuration problems in `ConfigError`. The root
//! error type, `Error`, wraps both so callers can handle every failure
//! uniformly at the top level.
//!
//! Task-level failures are not represented here. A unit of work reports
//! failure by returning `Err` (retry policies) or by panicking; schedulers
//! catch and log panics. A panic whose payload is [`Fatal`] marks an
//! unrecoverable failure and is allowed to terminate the worker thread.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Root error type for Weft.
#[derive(Debug, Error)]
pub enum Error {
    /// Scheduling and lifecycle errors
    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// General runtime errors
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by schedulers when they are used incorrectly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// The task manager has been terminated and accepts no new tasks
    #[error("task manager terminated")]
    Terminated,

    /// The wakeup manager has been stopped and accepts no new tickets
    #[error("wakeup manager stopped")]
    Stopped,

    /// A retry task was submitted or reset while a previous run is in flight
    #[error("task is already in flight")]
    InFlight,

    /// A cancelled retry task was submitted without being reset first
    #[error("task was cancelled; reset it before submitting again")]
    Cancelled,

    /// A thread priority outside the supported range
    #[error("invalid thread priority {0} (expected 1..=10)")]
    InvalidPriority(i32),
}

/// Errors related to loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration document could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration file could not be read
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),

    /// A numeric option is out of range
    #[error("invalid value for {option}: {reason}")]
    InvalidValue {
        /// Name of the offending option
        option: &'static str,

        /// Why the value was rejected
        reason: String,
    },

    /// A timeout option is zero
    #[error("{0} must be greater than zero, got {1:?}")]
    ZeroTimeout(&'static str, Duration),
}

/// Result type used throughout Weft.
pub type Result<T> = std::result::Result<T, Error>;

/// Panic payload marking an unrecoverable failure.
///
/// Workers catch ordinary panics from the work they run, log them and keep
/// going. A panic raised with `std::panic::panic_any(Fatal(..))` is instead
/// re-raised after the worker has released its bookkeeping, terminating the
/// worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fatal(pub String);

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal: {}", self.0)
    }
}

impl Fatal {
    /// Check whether a caught panic payload is a `Fatal` marker.
    pub fn is_fatal(payload: &(dyn std::any::Any + Send)) -> bool {
        payload.is::<Fatal>()
    }
}

/// Render a caught panic payload for logging.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(fatal) = payload.downcast_ref::<Fatal>() {
        fatal.to_string()
    } else {
        "<unknown panic>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: Error = ConcurrencyError::Terminated.into();
        assert!(matches!(err, Error::Concurrency(ConcurrencyError::Terminated)));
        assert_eq!(err.to_string(), "Concurrency error: task manager terminated");

        let err: Error = ConfigError::ZeroTimeout("idle_timeout", Duration::ZERO).into();
        assert!(err.to_string().contains("idle_timeout"));
    }

    #[test]
    fn test_invalid_priority_message() {
        let err = ConcurrencyError::InvalidPriority(42);
        assert_eq!(err.to_string(), "invalid thread priority 42 (expected 1..=10)");
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 1");

        let payload =
            std::panic::catch_unwind(|| std::panic::panic_any(Fatal("disk gone".into())))
                .unwrap_err();
        assert!(Fatal::is_fatal(payload.as_ref()));
        assert_eq!(panic_message(payload.as_ref()), "fatal: disk gone");
    }
}

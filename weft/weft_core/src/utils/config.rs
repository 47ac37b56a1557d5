//! Configuration utilities.
//!
//! Component configuration structs keep their durations as
//! `std::time::Duration` and expose them to configuration files as whole
//! milliseconds:
//!
//! ```
//! use std::time::Duration;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Example {
//!     #[serde(with = "weft_core::utils::duration_ms")]
//!     idle_timeout: Duration,
//! }
//!
//! let parsed: Example = toml::from_str("idle_timeout = 1500").unwrap();
//! assert_eq!(parsed.idle_timeout, Duration::from_millis(1500));
//! ```

use crate::error::ConfigError;
use std::time::Duration;

/// Serde adapter that represents a `Duration` as milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as whole milliseconds.
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    /// Deserialize a duration from whole milliseconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Reject a zero timeout for the named option.
pub fn ensure_non_zero(option: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroTimeout(option, value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_ms")]
        idle: Duration,
    }

    #[test]
    fn test_duration_ms_serialization() {
        let value = Timeouts {
            idle: Duration::from_secs(15),
        };
        let serialized = serde_json::to_string(&value).unwrap();
        assert_eq!(serialized, r#"{"idle":15000}"#);

        let deserialized: Timeouts = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, value);
    }

    #[test]
    fn test_duration_ms_truncates_sub_millisecond() {
        let value = Timeouts {
            idle: Duration::from_micros(2_750),
        };
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"{"idle":2}"#);
    }

    #[test]
    fn test_ensure_non_zero() {
        assert!(ensure_non_zero("idle_timeout", Duration::from_millis(1)).is_ok());
        assert!(matches!(
            ensure_non_zero("idle_timeout", Duration::ZERO),
            Err(ConfigError::ZeroTimeout("idle_timeout", _))
        ));
    }
}

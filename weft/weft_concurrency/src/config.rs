//! Runtime configuration.
//!
//! Bundles the configuration of every scheduler so a process can describe
//! them in one TOML document:
//!
//! ```toml
//! [task_manager]
//! max_threads = 10
//! idle_timeout = 15000
//! load_factor = 3.0
//!
//! [thread_pool]
//! idle_timeout = 300000
//!
//! [wakeup]
//! queue_thread_timeout = 30000
//! ```
//!
//! Durations are whole milliseconds. Missing sections and keys take their
//! defaults.

use crate::pool::thread::{ThreadPool, ThreadPoolConfig};
use crate::scheduler::task_manager::{TaskManager, TaskManagerConfig};
use crate::scheduler::wakeup::{WakeupConfig, WakeupManager};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use weft_core::error::ConfigError;
use weft_core::utils::ensure_non_zero;

/// Configuration of all schedulers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Task manager settings
    pub task_manager: TaskManagerConfig,

    /// Thread pool settings
    pub thread_pool: ThreadPoolConfig,

    /// Wakeup manager settings
    pub wakeup: WakeupConfig,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::InvalidValue {
            option: "runtime",
            reason: e.to_string(),
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tasks = &self.task_manager;
        if tasks.max_threads == 0 {
            return Err(ConfigError::InvalidValue {
                option: "task_manager.max_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(tasks.load_factor.is_finite() && tasks.load_factor > 0.0) {
            return Err(ConfigError::InvalidValue {
                option: "task_manager.load_factor",
                reason: format!("must be a positive number, got {}", tasks.load_factor),
            });
        }
        ensure_non_zero("task_manager.idle_timeout", tasks.idle_timeout)?;
        ensure_non_zero("thread_pool.idle_timeout", self.thread_pool.idle_timeout)?;
        ensure_non_zero("wakeup.queue_thread_timeout", self.wakeup.queue_thread_timeout)?;
        Ok(())
    }

    /// Create a task manager from this configuration
    pub fn task_manager(&self) -> TaskManager {
        TaskManager::with_config(self.task_manager.clone())
    }

    /// Create a thread pool from this configuration
    pub fn thread_pool(&self) -> ThreadPool {
        ThreadPool::with_config(self.thread_pool.clone())
    }

    /// Create a wakeup manager from this configuration
    pub fn wakeup_manager(&self) -> WakeupManager {
        WakeupManager::with_config(self.wakeup.clone())
    }
}

//! # Engine and service configuration.
//!
//! [`ScheduleConfig`] and [`TaskConfig`] name the external collaborators an
//! engine should use: the key/value instance for global coordination and the
//! definition-store instance for persisted entries. Names are resolved by the
//! supervisor against caller-supplied registries; an empty name means the
//! collaborator is not configured and every `Global`-scoped entry is skipped.
//!
//! # Example
//! ```
//! use tickvisor::{ScheduleConfig, TaskConfig};
//!
//! let mut cfg = ScheduleConfig::default();
//! cfg.global_lock_kv = "lock-main".into();
//!
//! let tasks = TaskConfig::default();
//! assert!(tasks.global_queue_kv.is_empty());
//! ```

use serde::Deserialize;

/// Configuration for the schedule engine.
#[derive(Clone, Debug, Deserialize)]
pub struct ScheduleConfig {
    /// Whether the engine runs at all.
    #[serde(default = "enabled")]
    pub enable: bool,
    /// Per-invocation success/failure logging for handlers.
    #[serde(default = "enabled")]
    pub enable_logger: bool,
    /// Name of the definition-store instance to pull `VASC_SCHEDULER` rows
    /// from. Empty disables database loading.
    #[serde(default, rename = "load_from_database")]
    pub load_schedule_db: String,
    /// Name of the key/value instance used for global locks. Empty disables
    /// `Global` scope.
    #[serde(default, rename = "global_lock_redis")]
    pub global_lock_kv: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enable: true,
            enable_logger: true,
            load_schedule_db: String::new(),
            global_lock_kv: String::new(),
        }
    }
}

/// Configuration for the task engine.
#[derive(Clone, Debug, Deserialize)]
pub struct TaskConfig {
    /// Whether the engine runs at all.
    #[serde(default = "enabled")]
    pub enable: bool,
    /// Per-invocation success/failure logging for handlers.
    #[serde(default = "enabled")]
    pub enable_logger: bool,
    /// Name of the definition-store instance to pull `VASC_TASK` rows from.
    #[serde(default, rename = "load_from_database")]
    pub load_task_db: String,
    /// Name of the key/value instance backing `Global` task queues.
    #[serde(default, rename = "global_queue_redis")]
    pub global_queue_kv: String,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            enable: true,
            enable_logger: true,
            load_task_db: String::new(),
            global_queue_kv: String::new(),
        }
    }
}

/// Top-level configuration consumed by the service supervisor.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub scheduler: ScheduleConfig,
    #[serde(default)]
    pub task: TaskConfig,
}

fn enabled() -> bool {
    true
}

//! Coordinator configuration
//!
//! All settings have defaults, so an empty JSON object is a valid config.
//! Durations are expressed in whole seconds or milliseconds as the field
//! name says.

use crate::error::{ConfigError, Error, Result};
use crate::scheduler::Strategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a [`crate::Coordinator`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    pub registry: RegistryConfig,
    pub coordination: CoordinationConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    /// Run `task:assigned` work on the registered agent with the same id
    pub auto_dispatch: bool,
}

impl CoordinatorConfig {
    /// Parse and validate a JSON config
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(ConfigError::Unreadable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.coordination.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> Error {
    Error::Config(ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    })
}

fn require_nonzero(field: &'static str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

/// Agent registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    pub max_agents: usize,
    pub heartbeat_interval_secs: u64,
    pub stale_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_agents: 100,
            heartbeat_interval_secs: 30,
            stale_timeout_secs: 120,
            cleanup_interval_secs: 60,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        require_nonzero("registry.maxAgents", self.max_agents as u64)?;
        require_nonzero("registry.heartbeatIntervalSecs", self.heartbeat_interval_secs)?;
        require_nonzero("registry.staleTimeoutSecs", self.stale_timeout_secs)?;
        require_nonzero("registry.cleanupIntervalSecs", self.cleanup_interval_secs)
    }
}

/// Coordination session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinationConfig {
    pub default_ttl_secs: u64,
    pub max_events_per_session: usize,
    pub sweep_interval_secs: u64,
    pub task_timeout_ms: u64,
    pub retry_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Concurrent event deliveries across all sessions
    pub delivery_workers: usize,
    pub delivery_timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            max_events_per_session: 1000,
            sweep_interval_secs: 60,
            task_timeout_ms: 300_000,
            retry_attempts: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            delivery_workers: 16,
            delivery_timeout_ms: 5000,
        }
    }
}

impl CoordinationConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn backoff(&self) -> crate::coordination::Backoff {
        crate::coordination::Backoff {
            base: Duration::from_millis(self.base_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
        }
    }

    fn validate(&self) -> Result<()> {
        require_nonzero("coordination.maxEventsPerSession", self.max_events_per_session as u64)?;
        require_nonzero("coordination.sweepIntervalSecs", self.sweep_interval_secs)?;
        require_nonzero("coordination.taskTimeoutMs", self.task_timeout_ms)?;
        require_nonzero("coordination.retryAttempts", self.retry_attempts as u64)?;
        require_nonzero("coordination.deliveryWorkers", self.delivery_workers as u64)?;
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(invalid(
                "coordination.maxBackoffMs",
                "must not be smaller than baseBackoffMs",
            ));
        }
        Ok(())
    }
}

/// Load balancer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub strategy: Strategy,
    pub max_agents: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub auto_recovery: bool,
    pub recovery_delay_secs: u64,
    pub default_max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Dynamic,
            max_agents: 100,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            auto_recovery: true,
            recovery_delay_secs: 30,
            default_max_attempts: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_secs(self.recovery_delay_secs)
    }

    fn validate(&self) -> Result<()> {
        require_nonzero("scheduler.maxAgents", self.max_agents as u64)?;
        require_nonzero("scheduler.heartbeatIntervalSecs", self.heartbeat_interval_secs)?;
        require_nonzero("scheduler.heartbeatTimeoutSecs", self.heartbeat_timeout_secs)?;
        require_nonzero("scheduler.defaultMaxAttempts", self.default_max_attempts as u64)
    }
}

/// Durable store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Persist sessions and pool agents; in-memory only when false
    pub enabled: bool,
    /// Directory for the database file, defaults to the platform data dir
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("agentyard")
        })
    }
}

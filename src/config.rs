use std::{fs, path::Path};

use serde::Deserialize;

use crate::{ProcflowError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// number of async worker threads, range [1, 32768), defaults to 16
    pub async_worker_thread_number: u16,
    /// how long shutdown waits for active transactions to drain
    pub shutdown_timeout_ms: u64,
    /// lock service config
    pub lock: LockConfig,
    /// flow-node transition config
    pub execution: ExecutionConfig,
    /// job scheduler config
    pub scheduler: SchedulerConfig,
    /// asynchronous work config
    pub work: WorkConfig,
    /// restart recovery config
    pub recovery: RecoveryConfig,
    /// audit trail config
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// bounded wait of the blocking `lock` call
    pub timeout_ms: u64,
    /// bounded wait used by flow-node transitions
    pub transition_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// attempts of one transition when it fails with a retryable error
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// flow nodes not stable for longer than this are re-executed by recovery
    pub stale_after_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// upper bound of the scheduler loop sleep
    pub poll_interval_ms: u64,
    /// default retries of a failing job
    pub max_job_retries: u32,
    pub retry_delay_ms: u64,
    /// maximum jobs acquired per loop iteration
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkConfig {
    /// number of work consumers
    pub worker_number: usize,
    /// pending works above which a backlog warning is logged
    pub queue_size: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// run a recovery sweep on launch
    pub enabled: bool,
    /// optional cron expression (with seconds) of a periodic sweep
    pub cron: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            async_worker_thread_number: 16,
            shutdown_timeout_ms: 10_000,
            lock: LockConfig::default(),
            execution: ExecutionConfig::default(),
            scheduler: SchedulerConfig::default(),
            work: WorkConfig::default(),
            recovery: RecoveryConfig {
                enabled: true,
                cron: None,
            },
            audit: AuditConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            transition_timeout_ms: 5_000,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 50,
            stale_after_ms: 60_000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_job_retries: 3,
            retry_delay_ms: 1_000,
            batch_size: 32,
        }
    }
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            worker_number: 4,
            queue_size: 1024,
        }
    }
}

impl Config {
    pub fn create<T: AsRef<Path>>(path: T) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .map_err(|e| ProcflowError::Config(format!("failed to load config file {:?}: {}", path.as_ref(), e)))?;

        Self::load_from_str(data.as_str())
    }

    pub fn load_from_str(toml_str: &str) -> Result<Self> {
        let config = toml::from_str::<Config>(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.async_worker_thread_number == 0 {
            return Err(ProcflowError::Config("async_worker_thread_number must be at least 1".to_string()));
        }
        if self.work.worker_number == 0 {
            return Err(ProcflowError::Config("work.worker_number must be at least 1".to_string()));
        }
        if self.execution.max_attempts == 0 {
            return Err(ProcflowError::Config("execution.max_attempts must be at least 1".to_string()));
        }
        if let Some(cron) = &self.recovery.cron {
            crate::scheduler::Trigger::validate_cron(cron)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::{Config, ProcflowError};

    #[test]
    fn test_config_deserialize() {
        let toml_str = r#"
        async_worker_thread_number = 10
        [lock]
        transition_timeout_ms = 250

        [scheduler]
        max_job_retries = 5

        [recovery]
        cron = "0 */5 * * * *"

        [audit]
        enabled = true
        "#;
        let config = Config::load_from_str(toml_str).unwrap();
        assert_eq!(config.async_worker_thread_number, 10);
        assert_eq!(config.lock.transition_timeout_ms, 250);
        assert_eq!(config.lock.timeout_ms, 60_000);
        assert_eq!(config.scheduler.max_job_retries, 5);
        assert_eq!(config.scheduler.batch_size, 32);
        assert_eq!(config.recovery.cron.as_deref(), Some("0 */5 * * * *"));
        assert!(config.audit.enabled);
    }

    #[test]
    fn test_config_defaults_from_empty() {
        let config = Config::load_from_str("").unwrap();
        assert_eq!(config.async_worker_thread_number, 16);
        assert!(config.recovery.enabled);
        assert!(!config.audit.enabled);
        assert_eq!(config.execution.max_attempts, 3);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(matches!(Config::load_from_str("[work]\nworker_number = 0"), Err(ProcflowError::Config(_))));
        assert!(Config::load_from_str("[recovery]\ncron = \"not a cron\"").is_err());
        assert!(matches!(Config::create("/nonexistent/procflow.toml"), Err(ProcflowError::Config(_))));
    }
}

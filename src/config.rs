//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::execution::record::ExecutionCategory;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrently running task executions.
    pub max_concurrent_tasks: usize,
    /// Maximum concurrently running workflow executions.
    pub max_concurrent_workflows: usize,
    /// Maximum concurrently running agent executions (`None` = uncapped).
    pub max_concurrent_agents: Option<usize>,
    /// Number of worker slots available to admitted work.
    pub worker_pool_size: usize,
    /// Timeout applied when a submission does not carry its own.
    pub default_timeout: Option<Duration>,
    /// How long `cancel` waits for a running unit to confirm cancellation.
    pub cancel_grace: Duration,
    /// Terminal records older than this are eligible for the periodic sweep.
    pub retention: Duration,
    /// Interval of the periodic cleanup sweep (`None` = manual cleanup only).
    pub cleanup_interval: Option<Duration>,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            max_concurrent_workflows: 3,
            max_concurrent_agents: None,
            worker_pool_size: 8,
            default_timeout: None,
            cancel_grace: Duration::from_secs(2),
            retention: Duration::from_secs(24 * 3600), // 24 hours
            cleanup_interval: None,
            event_buffer: 256,
        }
    }
}

impl SchedulerConfig {
    /// Build a config from `CREW_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("CREW_MAX_CONCURRENT_TASKS")? {
            config.max_concurrent_tasks = v;
        }
        if let Some(v) = env_parse::<usize>("CREW_MAX_CONCURRENT_WORKFLOWS")? {
            config.max_concurrent_workflows = v;
        }
        if let Some(v) = env_parse::<usize>("CREW_MAX_CONCURRENT_AGENTS")? {
            config.max_concurrent_agents = Some(v);
        }
        if let Some(v) = env_parse::<usize>("CREW_WORKER_POOL_SIZE")? {
            config.worker_pool_size = v;
        }
        if let Some(v) = env_parse::<u64>("CREW_DEFAULT_TIMEOUT_SECS")? {
            config.default_timeout = Some(Duration::from_secs(v));
        }
        if let Some(v) = env_parse::<u64>("CREW_CANCEL_GRACE_MS")? {
            config.cancel_grace = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("CREW_RETENTION_HOURS")? {
            let secs = v.checked_mul(3600).ok_or_else(|| ConfigError::InvalidValue {
                key: "CREW_RETENTION_HOURS".to_string(),
                message: format!("{v} hours is out of range"),
            })?;
            config.retention = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse::<u64>("CREW_CLEANUP_INTERVAL_SECS")? {
            config.cleanup_interval = Some(Duration::from_secs(v));
        }

        config.validate()?;
        Ok(config)
    }

    /// Admission cap for a category (`None` = uncapped).
    pub fn capacity(&self, category: ExecutionCategory) -> Option<usize> {
        match category {
            ExecutionCategory::Task => Some(self.max_concurrent_tasks),
            ExecutionCategory::Workflow => Some(self.max_concurrent_workflows),
            ExecutionCategory::Agent => self.max_concurrent_agents,
        }
    }

    /// Sum of every gated category's capacity.
    pub fn gated_capacity(&self) -> usize {
        self.max_concurrent_tasks
            + self.max_concurrent_workflows
            + self.max_concurrent_agents.unwrap_or(0)
    }

    /// Reject configurations that could starve admitted work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("max_concurrent_tasks", self.max_concurrent_tasks),
            ("max_concurrent_workflows", self.max_concurrent_workflows),
            ("worker_pool_size", self.worker_pool_size),
            ("event_buffer", self.event_buffer),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if self.cleanup_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ConfigError::InvalidValue {
                key: "cleanup_interval".to_string(),
                message: "must be greater than zero when set".to_string(),
            });
        }

        if self.max_concurrent_agents == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_agents".to_string(),
                message: "must be greater than zero when set".to_string(),
            });
        }

        // Admitted work must never wait on a worker slot held by another gate.
        if self.worker_pool_size < self.gated_capacity() {
            return Err(ConfigError::InvalidValue {
                key: "worker_pool_size".to_string(),
                message: format!(
                    "{} is smaller than the combined category capacity {}",
                    self.worker_pool_size,
                    self.gated_capacity()
                ),
            });
        }

        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_limits() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.max_concurrent_workflows, 3);
        assert_eq!(config.max_concurrent_agents, None);
        assert_eq!(config.worker_pool_size, 8);
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity(ExecutionCategory::Workflow), Some(3));
        assert_eq!(config.capacity(ExecutionCategory::Agent), None);
    }

    #[test]
    fn undersized_pool_rejected() {
        let config = SchedulerConfig {
            worker_pool_size: 4,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "worker_pool_size"));
    }

    #[test]
    fn agent_cap_counts_toward_pool() {
        let config = SchedulerConfig {
            max_concurrent_agents: Some(2),
            ..Default::default()
        };
        assert_eq!(config.gated_capacity(), 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = SchedulerConfig {
            max_concurrent_tasks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_cleanup_interval_rejected() {
        let config = SchedulerConfig {
            cleanup_interval: Some(Duration::ZERO),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "cleanup_interval"));

        let config = SchedulerConfig {
            cleanup_interval: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn oversized_retention_rejected() {
        // SAFETY: only this test touches CREW_RETENTION_HOURS.
        unsafe { std::env::set_var("CREW_RETENTION_HOURS", u64::MAX.to_string()) };
        let result = SchedulerConfig::from_env();
        unsafe { std::env::remove_var("CREW_RETENTION_HOURS") };
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CREW_RETENTION_HOURS"));
    }

    #[test]
    fn env_parse_reports_key() {
        // SAFETY: test-local variable name, not read by any other test.
        unsafe { std::env::set_var("CREW_TEST_BAD_NUMBER", "many") };
        let err = env_parse::<usize>("CREW_TEST_BAD_NUMBER").unwrap_err();
        assert!(err.to_string().contains("CREW_TEST_BAD_NUMBER"));
        assert!(env_parse::<usize>("CREW_TEST_UNSET_NUMBER").unwrap().is_none());
    }
}

use thiserror::Error;

use crate::operation::OperationKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub janitor: JanitorConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Delay before an idle worker re-scans the queues
    pub idle_backoff_ms: u64,
    /// Poll interval used by result waiters
    pub result_poll_ms: u64,
    /// Number of concurrent worker tasks
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum pending operations per principal queue
    pub capacity: usize,
    /// Fraction of capacity at which overflow pressure is recorded
    pub watermark: f64,
}

impl QueueConfig {
    /// Queue depth at which the near-capacity warning fires.
    pub fn watermark_len(&self) -> usize {
        (self.capacity as f64 * self.watermark).floor() as usize
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// First retry delay; doubled on every further attempt
    pub backoff_base_ms: u64,
    /// Ceiling for the backoff delay
    pub backoff_cap_ms: u64,
    /// Default retry budget for operations that do not specify one
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Sweep interval
    pub interval_ms: u64,
    /// Pending operations older than this are expired
    pub pending_age_limit_ms: u64,
    /// Finished operations are dropped from the registry after this long
    pub terminal_retention_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub extend_session_ms: u64,
    pub generic_ms: u64,
    pub logout_ms: u64,
    pub refresh_ms: u64,
    pub validate_ms: u64,
}

impl TimeoutConfig {
    /// Default execution timeout for the given operation kind.
    ///
    /// Refresh and session extension get a longer budget than plain
    /// validation since they cascade to the external token service.
    pub fn for_kind(&self, kind: OperationKind) -> u64 {
        match kind {
            OperationKind::ExtendSession => self.extend_session_ms,
            OperationKind::GenericRequest => self.generic_ms,
            OperationKind::Logout => self.logout_ms,
            OperationKind::RefreshToken => self.refresh_ms,
            OperationKind::ValidateToken => self.validate_ms,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_backoff_ms: 100,
            result_poll_ms: 50,
            workers: 5,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            watermark: 0.95,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            max_retries: 3,
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            pending_age_limit_ms: 300_000, // 5 minutes
            terminal_retention_ms: 300_000,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            extend_session_ms: 15_000,
            generic_ms: 10_000,
            logout_ms: 5_000,
            refresh_ms: 15_000,
            validate_ms: 5_000,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let watermark = std::env::var("QUEUE_WATERMARK")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.95);

        let config = Config {
            dispatch: DispatchConfig {
                idle_backoff_ms: env_u64("IDLE_BACKOFF_MS", 100),
                result_poll_ms: env_u64("RESULT_POLL_MS", 50),
                workers: env_u64("WORKER_COUNT", 5) as usize,
            },
            janitor: JanitorConfig {
                interval_ms: env_u64("JANITOR_INTERVAL_MS", 60_000),
                pending_age_limit_ms: env_u64("PENDING_AGE_LIMIT_MS", 300_000),
                terminal_retention_ms: env_u64("TERMINAL_RETENTION_MS", 300_000),
            },
            queue: QueueConfig {
                capacity: env_u64("QUEUE_CAPACITY", 100) as usize,
                watermark,
            },
            retry: RetryConfig {
                backoff_base_ms: env_u64("RETRY_BACKOFF_BASE_MS", 500),
                backoff_cap_ms: env_u64("RETRY_BACKOFF_CAP_MS", 30_000),
                max_retries: env_u64("MAX_RETRIES", 3) as u32,
            },
            timeouts: TimeoutConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.workers == 0 {
            return Err(ConfigError::ValidationError(
                "WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        if self.queue.capacity < 2 {
            return Err(ConfigError::ValidationError(
                "QUEUE_CAPACITY must be at least 2".to_string(),
            ));
        }

        if !(self.queue.watermark > 0.0 && self.queue.watermark <= 1.0) {
            return Err(ConfigError::ValidationError(
                "QUEUE_WATERMARK must be in (0, 1]".to_string(),
            ));
        }

        if self.retry.backoff_cap_ms < self.retry.backoff_base_ms {
            return Err(ConfigError::ValidationError(
                "RETRY_BACKOFF_CAP_MS must be at least RETRY_BACKOFF_BASE_MS".to_string(),
            ));
        }

        if self.dispatch.workers > 64 {
            tracing::warn!(
                "Worker pool of {} is unusually large for an in-process queue.",
                self.dispatch.workers
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = Config {
            dispatch: DispatchConfig {
                workers: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_capacity_rejected() {
        let config = Config {
            queue: QueueConfig {
                capacity: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_watermark_out_of_range_rejected() {
        let config = Config {
            queue: QueueConfig {
                capacity: 100,
                watermark: 1.5,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_cap_below_base_rejected() {
        let config = Config {
            retry: RetryConfig {
                backoff_base_ms: 1_000,
                backoff_cap_ms: 500,
                max_retries: 3,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_watermark_len() {
        let queue = QueueConfig {
            capacity: 100,
            watermark: 0.95,
        };
        assert_eq!(queue.watermark_len(), 95);

        let queue = QueueConfig {
            capacity: 2,
            watermark: 0.95,
        };
        assert_eq!(queue.watermark_len(), 1);
    }

    #[test]
    fn test_refresh_timeout_exceeds_validation() {
        let timeouts = TimeoutConfig::default();
        assert!(timeouts.for_kind(OperationKind::RefreshToken) > timeouts.for_kind(OperationKind::ValidateToken));
        assert!(timeouts.for_kind(OperationKind::ExtendSession) > timeouts.for_kind(OperationKind::ValidateToken));
    }
}

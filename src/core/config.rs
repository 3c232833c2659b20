use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Result, StagehandError};

/// Backoff strategy between retries of a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay
    Fixed,
    /// Linear increase
    Linear,
    /// Exponential backoff
    Exponential,
    /// Exponential with ±10% jitter
    ExponentialJitter,
}

/// Retry policy used by the deterministic executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; only transient failures are retried
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor for exponential strategies
    pub multiplier: f64,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 250,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            backoff: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay to wait before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let exponent = retry.saturating_sub(1) as i32;
        let millis = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * retry.max(1) as f64,
            BackoffStrategy::Exponential => base * self.multiplier.powi(exponent),
            BackoffStrategy::ExponentialJitter => {
                let jitter = fastrand::f64() * 0.2 - 0.1;
                base * self.multiplier.powi(exponent) * (1.0 + jitter)
            }
        };
        Duration::from_millis(millis.round().min(self.max_delay_ms as f64).max(0.0) as u64)
    }
}

/// Configuration for the orchestration engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of stages executing at the same time
    pub max_parallel_stages: usize,
    /// Deadline for a delegate attempt, unless the stage sets its own
    pub stage_timeout_ms: u64,
    /// Deadline for the whole recovery of one stage
    pub fallback_timeout_ms: u64,
    /// Deadline for a single provider call
    pub operation_timeout_ms: u64,
    /// Buffered run events per subscriber before the oldest are dropped
    pub event_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: 8,
            stage_timeout_ms: 120_000,
            fallback_timeout_ms: 60_000,
            operation_timeout_ms: 30_000,
            event_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_stages == 0 {
            return Err(StagehandError::configuration_field(
                "max_parallel_stages must be greater than 0",
                "max_parallel_stages",
            ));
        }
        for (field, value) in [
            ("stage_timeout_ms", self.stage_timeout_ms),
            ("fallback_timeout_ms", self.fallback_timeout_ms),
            ("operation_timeout_ms", self.operation_timeout_ms),
        ] {
            if value == 0 {
                return Err(StagehandError::configuration_field(
                    format!("{} must be greater than 0", field),
                    field,
                ));
            }
        }
        if self.event_capacity == 0 {
            return Err(StagehandError::configuration_field(
                "event_capacity must be greater than 0",
                "event_capacity",
            ));
        }
        if self.retry.max_retries > 10 {
            return Err(StagehandError::configuration_field(
                "retry.max_retries cannot exceed 10",
                "retry.max_retries",
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(StagehandError::configuration_field(
                "retry.multiplier must be at least 1.0",
                "retry.multiplier",
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(StagehandError::configuration_field(
                "retry.initial_delay_ms cannot exceed retry.max_delay_ms",
                "retry.initial_delay_ms",
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| StagehandError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn with_max_parallel_stages(mut self, max: usize) -> Self {
        self.max_parallel_stages = max;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.backoff, BackoffStrategy::Exponential);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = EngineConfig::default().with_max_parallel_stages(0);
        assert!(matches!(
            config.validate(),
            Err(StagehandError::Configuration { field: Some(ref f), .. })
                if f == "max_parallel_stages"
        ));

        let mut config = EngineConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fallback_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            multiplier: 2.0,
            backoff: BackoffStrategy::Exponential,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn test_linear_and_fixed_delays() {
        let mut policy = RetryPolicy {
            initial_delay_ms: 40,
            backoff: BackoffStrategy::Linear,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(3), Duration::from_millis(120));
        policy.backoff = BackoffStrategy::Fixed;
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy {
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff: BackoffStrategy::ExponentialJitter,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(2).as_millis();
            assert!((1_800..=2_200).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
max_parallel_stages: 2
retry:
  max_retries: 4
  backoff: fixed
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_parallel_stages, 2);
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.backoff, BackoffStrategy::Fixed);
        assert_eq!(config.stage_timeout_ms, 120_000);
        assert_eq!(config.retry.initial_delay_ms, 250);
    }

    #[test]
    fn test_invalid_yaml_is_rejected_on_load() {
        let yaml = "retry:\n  max_retries: 50\n";
        assert!(matches!(
            EngineConfig::from_yaml_str(yaml),
            Err(StagehandError::Configuration { .. })
        ));
    }
}

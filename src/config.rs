/*!
 * Configuration for the Taskguard toolkit
 *
 * One TOML file with a table per primitive. Every field has a default, so an
 * empty file (or no file at all) yields a working configuration.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskguard_core_dead_letter::DeadLetterConfig;
use taskguard_core_resilience::{
    CircuitBreakerConfig, Dispatcher, ErrorKind, PoolConfig, RateLimiterConfig, RetryPolicy,
};

use crate::error::{Result, TaskguardError};

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "taskguard.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolkitConfig {
    pub logging: LoggingConfig,
    pub pool: PoolSettings,
    pub retry: RetrySettings,
    pub rate_limiter: RateLimiterSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub dispatch: DispatchSettings,
    pub dead_letter: DeadLetterSettings,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// Log file path (None = stderr)
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout_secs: u64,
    pub max_inactive_secs: u64,
    pub health_check_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout_secs: 30,
            max_inactive_secs: 300,
            health_check_interval_secs: 60,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.min_size,
            max_size: self.max_size,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            max_inactive_time: Duration::from_secs(self.max_inactive_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,

    /// Error kinds that are retried (snake_case names)
    pub retry_on: Vec<String>,

    /// Error kinds that stop retrying at once (snake_case names)
    pub stop_on: Vec<String>,

    pub log_before_sleep: bool,
    pub log_after_failure: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            min_wait_ms: 1000,
            max_wait_ms: 10_000,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
            retry_on: kind_names(&policy.retry_on),
            stop_on: kind_names(&policy.stop_on),
            log_before_sleep: true,
            log_after_failure: true,
        }
    }
}

fn kind_names<'a>(kinds: impl IntoIterator<Item = &'a ErrorKind>) -> Vec<String> {
    kinds.into_iter().map(|k| k.as_str().to_string()).collect()
}

fn parse_kinds(field: &str, names: &[String]) -> Result<Vec<ErrorKind>> {
    names
        .iter()
        .map(|name| {
            ErrorKind::parse(name).ok_or_else(|| {
                TaskguardError::Config(format!("retry.{}: unknown error kind '{}'", field, name))
            })
        })
        .collect()
}

impl RetrySettings {
    pub fn to_policy(&self) -> Result<RetryPolicy> {
        let mut policy = RetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_min_wait(Duration::from_millis(self.min_wait_ms))
            .with_max_wait(Duration::from_millis(self.max_wait_ms))
            .with_multiplier(self.multiplier)
            .with_jitter(self.jitter)
            .retry_on(parse_kinds("retry_on", &self.retry_on)?)
            .stop_on(parse_kinds("stop_on", &self.stop_on)?);
        policy.log_before_sleep = self.log_before_sleep;
        policy.log_after_failure = self.log_after_failure;
        Ok(policy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub max_calls_per_minute: u32,
    pub max_calls_per_hour: u32,
    pub burst_size: u32,
    pub cooldown_seconds: u64,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        let defaults = RateLimiterConfig::default();
        Self {
            max_calls_per_minute: defaults.max_calls_per_minute,
            max_calls_per_hour: defaults.max_calls_per_hour,
            burst_size: defaults.burst_size,
            cooldown_seconds: defaults.cooldown_seconds,
        }
    }
}

impl RateLimiterSettings {
    pub fn to_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_calls_per_minute: self.max_calls_per_minute,
            max_calls_per_hour: self.max_calls_per_hour,
            burst_size: self.burst_size,
            cooldown_seconds: self.cooldown_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub recovery_timeout_secs: u64,
    pub history_retention_hours: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout_secs: 60,
            history_retention_hours: 24,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            history_retention: Duration::from_secs(
                self.history_retention_hours.saturating_mul(3600),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub max_concurrent: usize,

    /// Per-operation deadline (None = no deadline)
    pub operation_timeout_secs: Option<u64>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            operation_timeout_secs: None,
        }
    }
}

impl DispatchSettings {
    pub fn to_dispatcher(&self) -> Result<Dispatcher> {
        let dispatcher = Dispatcher::new(self.max_concurrent)?;
        Ok(match self.operation_timeout_secs {
            Some(secs) => dispatcher.with_operation_timeout(Duration::from_secs(secs)),
            None => dispatcher,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterSettings {
    /// SQLite database file
    pub path: PathBuf,
    pub cache_capacity: usize,
    pub busy_timeout_ms: u64,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("taskguard-dlq.db"),
            cache_capacity: 5,
            busy_timeout_ms: 5000,
        }
    }
}

impl DeadLetterSettings {
    pub fn to_store_config(&self) -> DeadLetterConfig {
        DeadLetterConfig {
            path: self.path.clone(),
            cache_capacity: self.cache_capacity,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

impl ToolkitConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ToolkitConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Load `path` if given, else `taskguard.toml` if present, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Reject settings the primitives cannot run with
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        if pool.min_size < 1 || pool.max_size < pool.min_size {
            return Err(TaskguardError::Config(format!(
                "pool: need 1 <= min_size ({}) <= max_size ({})",
                pool.min_size, pool.max_size
            )));
        }
        if self.retry.max_attempts < 1 {
            return Err(TaskguardError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(TaskguardError::Config(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.rate_limiter.burst_size < 1 {
            return Err(TaskguardError::Config(
                "rate_limiter.burst_size must be at least 1".to_string(),
            ));
        }
        if self.dispatch.max_concurrent < 1 {
            return Err(TaskguardError::Config(
                "dispatch.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold < 1 {
            return Err(TaskguardError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        // Catches unknown kind names
        self.retry.to_policy()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ToolkitConfig::default();
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.rate_limiter.max_calls_per_minute, 30);
        assert_eq!(config.rate_limiter.max_calls_per_hour, 1000);
        assert_eq!(config.rate_limiter.burst_size, 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.dead_letter.cache_capacity, 5);
        assert!(config.retry.retry_on.contains(&"transient".to_string()));
        assert!(config.retry.stop_on.contains(&"permanent".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ToolkitConfig = toml::from_str(
            r#"
            [pool]
            max_size = 4

            [retry]
            retry_on = ["timeout"]

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.min_size, 1);
        assert_eq!(config.retry.retry_on, vec!["timeout".to_string()]);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.dispatch.operation_timeout_secs, None);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskguard.toml");

        let mut config = ToolkitConfig::default();
        config.dispatch.operation_timeout_secs = Some(15);
        config.logging.file = Some(PathBuf::from("/var/log/taskguard.json"));
        config.to_file(&path).unwrap();

        let loaded = ToolkitConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut config = ToolkitConfig::default();
        config.pool.min_size = 5;
        config.pool.max_size = 2;
        assert!(matches!(config.validate(), Err(TaskguardError::Config(_))));

        let mut config = ToolkitConfig::default();
        config.dispatch.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = ToolkitConfig::default();
        config.retry.stop_on.push("gremlins".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gremlins"));
    }

    #[test]
    fn test_validate_rejects_nan_multiplier() {
        let mut config = ToolkitConfig::default();
        config.retry.multiplier = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_history_retention_saturates() {
        let mut config = ToolkitConfig::default();
        config.circuit_breaker.history_retention_hours = u64::MAX;
        let breaker = config.circuit_breaker.to_breaker_config();
        assert_eq!(breaker.history_retention, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_conversions() {
        let config = ToolkitConfig::default();

        let pool = config.pool.to_pool_config();
        assert_eq!(pool.acquire_timeout, Duration::from_secs(30));
        assert_eq!(pool.max_inactive_time, Duration::from_secs(300));

        let policy = config.retry.to_policy().unwrap();
        assert_eq!(policy, RetryPolicy::default());

        let breaker = config.circuit_breaker.to_breaker_config();
        assert_eq!(breaker, CircuitBreakerConfig::default());

        let limiter = config.rate_limiter.to_limiter_config();
        assert_eq!(limiter, RateLimiterConfig::default());

        let dispatcher = config.dispatch.to_dispatcher().unwrap();
        assert_eq!(dispatcher.max_concurrent(), 10);
        assert_eq!(dispatcher.operation_timeout(), None);

        let store = config.dead_letter.to_store_config();
        assert_eq!(store, DeadLetterConfig::default());
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }
}

//! Configuration consumed by the connection manager and its pool
//!
//! Loaded from TOML the way the server configuration is: every section has
//! defaults, durations are plain integers with a unit suffix in the key.

use crate::exception::{XaError, XaResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How idle connections are matched against an allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Credential identity and every connection property must match
    #[default]
    Strict,
    /// Only credential identity must match
    CredentialOnly,
}

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on idle plus checked-out connections
    pub max_size: usize,
    /// Connections kept open by prefill and spared by eviction
    pub min_size: usize,
    /// How long an acquire waits for a free slot before failing
    pub acquire_timeout_ms: u64,
    /// Idle time after which an available connection is evicted
    pub idle_timeout_secs: u64,
    /// Age after which an available connection is evicted regardless of use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lifetime_secs: Option<u64>,
    /// Period of the idle-eviction sweep
    pub eviction_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_size: 0,
            acquire_timeout_ms: 5000,
            idle_timeout_secs: 300,
            max_lifetime_secs: None,
            eviction_interval_secs: 30,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn validate(&self) -> XaResult<()> {
        if self.max_size == 0 {
            return Err(XaError::configuration("pool max_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(XaError::configuration(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(XaError::configuration(
                "pool acquire_timeout_ms must be greater than 0",
            ));
        }
        if self.eviction_interval_secs == 0 {
            return Err(XaError::configuration(
                "pool eviction_interval_secs must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Local retry of switch operations answering RETRY
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 10,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Backoff to sleep before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn validate(&self) -> XaResult<()> {
        if self.max_attempts == 0 {
            return Err(XaError::configuration(
                "retry max_attempts must be greater than 0",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(XaError::configuration(
                "retry backoff_multiplier must be >= 1.0",
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(XaError::configuration(
                "retry max_backoff_ms must be >= initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Everything the connection manager is constructed with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub match_policy: MatchPolicy,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
}

impl ManagerConfig {
    pub fn validate(&self) -> XaResult<()> {
        self.pool.validate()?;
        self.retry.validate()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> XaResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub async fn load_from_file(path: &Path) -> XaResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> XaResult<String> {
        toml::to_string_pretty(self).map_err(|e| XaError::configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.match_policy, MatchPolicy::Strict);
        assert_eq!(config.pool.acquire_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ManagerConfig::from_toml_str(
            r#"
            match_policy = "credential_only"

            [pool]
            max_size = 4
            min_size = 1
            acquire_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.min_size, 1);
        assert_eq!(config.pool.acquire_timeout(), Duration::from_millis(250));
        assert_eq!(config.pool.idle_timeout_secs, 300);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.match_policy, MatchPolicy::CredentialOnly);
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let result = ManagerConfig::from_toml_str(
            r#"
            [pool]
            max_size = 2
            min_size = 3
            "#,
        );
        assert!(matches!(result, Err(XaError::Configuration(_))));

        let config = ManagerConfig {
            pool: PoolConfig {
                max_size: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_validation_and_backoff() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 10,
            backoff_multiplier: 2.0,
            max_backoff_ms: 35,
        };
        assert!(retry.validate().is_ok());
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(35));

        let bad = RetryConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ManagerConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ManagerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_error() {
        let result = ManagerConfig::load_from_file(Path::new("/nonexistent/orbit-xa.toml")).await;
        assert!(matches!(result, Err(XaError::Io(_))));
    }
}

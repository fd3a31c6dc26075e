//! Engine configuration.
//!
//! Values come from code (`EngineConfig::default()` plus `with_*` overrides) or
//! from the environment via [`EngineConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How poll attempts are counted against `max_poll_attempts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPolicy {
    /// Every tick consumes one attempt, including ticks whose poll call failed
    /// or timed out. Under a flaky external dependency the attempt budget can
    /// run out before `poll_timeout` does.
    #[default]
    EveryTick,
    /// Only poll calls that returned a status consume an attempt. Failed calls
    /// are bounded by `poll_timeout` alone.
    SuccessfulPollsOnly,
}

impl core::str::FromStr for AttemptPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "every_tick" => Ok(Self::EveryTick),
            "successful_polls_only" => Ok(Self::SuccessfulPollsOnly),
            other => Err(ConfigError::Invalid {
                key: ENV_ATTEMPT_POLICY,
                reason: format!("unknown attempt policy '{other}'"),
            }),
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

const ENV_MAX_CONCURRENT: &str = "TASKFORGE_MAX_CONCURRENT";
const ENV_POLL_INTERVAL_MS: &str = "TASKFORGE_POLL_INTERVAL_MS";
const ENV_POLL_TIMEOUT_SECS: &str = "TASKFORGE_POLL_TIMEOUT_SECS";
const ENV_MAX_POLL_ATTEMPTS: &str = "TASKFORGE_MAX_POLL_ATTEMPTS";
const ENV_POLL_CALL_TIMEOUT_MS: &str = "TASKFORGE_POLL_CALL_TIMEOUT_MS";
const ENV_ATTEMPT_POLICY: &str = "TASKFORGE_ATTEMPT_POLICY";

/// Task engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of in-process executors running at once
    pub max_concurrent: usize,
    /// Delay between two polls of the same external task
    pub poll_interval: Duration,
    /// Overall budget for an external task to reach completion
    pub poll_timeout: Duration,
    /// Maximum number of poll attempts per external task
    pub max_poll_attempts: u32,
    /// Bound on a single poller call
    pub poll_call_timeout: Duration,
    /// How attempts are counted
    pub attempt_policy: AttemptPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(30 * 60),
            max_poll_attempts: 360,
            poll_call_timeout: Duration::from_secs(30),
            attempt_policy: AttemptPolicy::EveryTick,
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    pub fn with_poll_call_timeout(mut self, timeout: Duration) -> Self {
        self.poll_call_timeout = timeout;
        self
    }

    pub fn with_attempt_policy(mut self, policy: AttemptPolicy) -> Self {
        self.attempt_policy = policy;
        self
    }

    /// Check that every bound is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(invalid(ENV_MAX_CONCURRENT, "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid(ENV_POLL_INTERVAL_MS, "must be positive"));
        }
        if self.poll_timeout.is_zero() {
            return Err(invalid(ENV_POLL_TIMEOUT_SECS, "must be positive"));
        }
        if self.max_poll_attempts == 0 {
            return Err(invalid(ENV_MAX_POLL_ATTEMPTS, "must be at least 1"));
        }
        if self.poll_call_timeout.is_zero() {
            return Err(invalid(ENV_POLL_CALL_TIMEOUT_MS, "must be positive"));
        }
        if self.poll_call_timeout > self.poll_timeout {
            return Err(invalid(
                ENV_POLL_CALL_TIMEOUT_MS,
                "must not exceed the overall poll timeout",
            ));
        }
        Ok(())
    }

    /// Build a configuration from `TASKFORGE_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_MAX_CONCURRENT) {
            config.max_concurrent = parse(ENV_MAX_CONCURRENT, &v)?;
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL_MS) {
            config.poll_interval = Duration::from_millis(parse(ENV_POLL_INTERVAL_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_POLL_TIMEOUT_SECS) {
            config.poll_timeout = Duration::from_secs(parse(ENV_POLL_TIMEOUT_SECS, &v)?);
        }
        if let Some(v) = lookup(ENV_MAX_POLL_ATTEMPTS) {
            config.max_poll_attempts = parse(ENV_MAX_POLL_ATTEMPTS, &v)?;
        }
        if let Some(v) = lookup(ENV_POLL_CALL_TIMEOUT_MS) {
            config.poll_call_timeout =
                Duration::from_millis(parse(ENV_POLL_CALL_TIMEOUT_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_ATTEMPT_POLICY) {
            config.attempt_policy = v.trim().parse()?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| invalid(key, format!("'{raw}': {e}")))
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

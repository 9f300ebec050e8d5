//! Engine configuration.
//!
//! Defaults can be overridden through `BUILDLOOP_*` environment variables
//! (see [`EngineConfig::from_env`]) and then by explicit CLI flags.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Retry budgets, timeouts and pool sizing for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries allowed per content-repair bucket before a step is aborted.
    pub retry_budget: u32,
    /// Retries allowed for environment/transient failures.
    pub transient_budget: u32,
    /// Default timeout for every `execute` invocation.
    pub command_timeout_secs: u64,
    /// Upper bound on concurrently running steps within a phase.
    pub max_workers: usize,
    /// Time a terminated child gets to exit before it is force-killed.
    pub kill_grace_ms: u64,
    /// Bytes kept per captured stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            transient_budget: 1,
            command_timeout_secs: 120,
            max_workers: 8,
            kill_grace_ms: 2_000,
            output_limit_bytes: 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults overlaid with `BUILDLOOP_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "BUILDLOOP_RETRY_BUDGET")? {
            config.retry_budget = v;
        }
        if let Some(v) = parse_var(&lookup, "BUILDLOOP_TRANSIENT_BUDGET")? {
            config.transient_budget = v;
        }
        if let Some(v) = parse_var(&lookup, "BUILDLOOP_COMMAND_TIMEOUT_SECS")? {
            config.command_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "BUILDLOOP_MAX_WORKERS")? {
            config.max_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "BUILDLOOP_KILL_GRACE_MS")? {
            config.kill_grace_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "BUILDLOOP_OUTPUT_LIMIT_BYTES")? {
            config.output_limit_bytes = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retry_budget == 0 {
            return Err(EngineError::InvalidConfig(
                "retry_budget must be at least 1".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(EngineError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(EngineError::InvalidConfig(
                "command_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::InvalidConfig(format!("{key}={raw:?} is not a valid value"))),
    }
}

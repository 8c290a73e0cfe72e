//! Throttled runner configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`RunnerConfig::max_parallelism`].
pub const ENV_MAX_PARALLELISM: &str = "THROTTLE_MAX_PARALLELISM";
/// Environment variable overriding [`RunnerConfig::stop_on_error`].
pub const ENV_STOP_ON_ERROR: &str = "THROTTLE_STOP_ON_ERROR";
/// Environment variable overriding [`RunnerConfig::max_per_window`].
pub const ENV_MAX_PER_WINDOW: &str = "THROTTLE_MAX_PER_WINDOW";
/// Environment variable overriding [`RunnerConfig::window_ms`].
pub const ENV_WINDOW_MS: &str = "THROTTLE_WINDOW_MS";

/// Limits applied by a [`ThrottledRunner`](crate::core::ThrottledRunner).
///
/// `0` disables the respective limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum operations in flight.
    pub max_parallelism: usize,
    /// Abandon remaining work after the first fault.
    pub stop_on_error: bool,
    /// Maximum operation starts per rolling window.
    pub max_per_window: usize,
    /// Rolling window length in milliseconds.
    pub window_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: num_cpus::get(),
            stop_on_error: false,
            max_per_window: 0,
            window_ms: 0,
        }
    }
}

impl RunnerConfig {
    /// Create a configuration with defaults (one slot per logical CPU, no rate limit).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the parallelism cap (`0` = unbounded).
    #[must_use]
    pub const fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    /// Select stop-on-first-error (`true`) or continue-on-error (`false`).
    #[must_use]
    pub const fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    /// Allow at most `max_per_window` starts within any rolling `window`.
    #[must_use]
    pub fn with_rate_limit(mut self, max_per_window: usize, window: Duration) -> Self {
        self.max_per_window = max_per_window;
        self.window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// The rolling window as a `Duration`.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Whether the rolling rate window is in effect.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        self.max_per_window > 0 && self.window_ms > 0
    }

    /// Load defaults, then apply overrides from the process environment and
    /// a `.env` file, if present.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup(ENV_MAX_PARALLELISM) {
            cfg.max_parallelism = parse_var(ENV_MAX_PARALLELISM, &v)?;
        }
        if let Some(v) = lookup(ENV_STOP_ON_ERROR) {
            cfg.stop_on_error = parse_var(ENV_STOP_ON_ERROR, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_PER_WINDOW) {
            cfg.max_per_window = parse_var(ENV_MAX_PER_WINDOW, &v)?;
        }
        if let Some(v) = lookup(ENV_WINDOW_MS) {
            cfg.window_ms = parse_var(ENV_WINDOW_MS, &v)?;
        }
        Ok(cfg)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{key}=`{value}` is invalid: {e}"))
}

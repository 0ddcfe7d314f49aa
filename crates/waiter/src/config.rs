//! Wait policy: budget, tick rate, and how fetch failures are tolerated.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::WaitError;

/// Default time between poll attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default overall budget for a single wait (matches a single certificate issuance).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Ceiling for the tick delay while backing off from repeated fetch errors.
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// What a "not found" fetch means for this wait.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NotFoundPolicy {
    /// The object may not have propagated yet; keep polling until the timeout.
    #[default]
    Retry,
    /// The object must already exist; a miss ends the wait.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub not_found: NotFoundPolicy,
    /// Give up once more than this many transient errors occur in a row.
    /// `None` tolerates them until the timeout.
    pub max_consecutive_errors: Option<u32>,
    /// Growth factor of the tick delay per consecutive transient error (1.0 = fixed rate).
    pub error_backoff_multiplier: f64,
    pub max_poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            not_found: NotFoundPolicy::Retry,
            max_consecutive_errors: Some(DEFAULT_MAX_CONSECUTIVE_ERRORS),
            error_backoff_multiplier: 1.0,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
        }
    }
}

impl WaitConfig {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self { timeout, poll_interval, ..Default::default() }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_not_found(mut self, policy: NotFoundPolicy) -> Self {
        self.not_found = policy;
        self
    }

    pub fn with_max_consecutive_errors(mut self, max: Option<u32>) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    pub fn with_error_backoff(mut self, multiplier: f64, max_poll_interval: Duration) -> Self {
        self.error_backoff_multiplier = multiplier;
        self.max_poll_interval = max_poll_interval;
        self
    }

    /// Defaults overlaid with `CONVERGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`; unparsable values are ignored.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = lookup("CONVERGE_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = lookup("CONVERGE_POLL_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("CONVERGE_MAX_CONSECUTIVE_ERRORS") {
            match raw.trim() {
                "none" | "unbounded" => cfg.max_consecutive_errors = None,
                s => {
                    if let Ok(n) = s.parse::<u32>() {
                        cfg.max_consecutive_errors = Some(n);
                    }
                }
            }
        }
        if let Some(raw) = lookup("CONVERGE_ALLOW_MISSING") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "0" | "false" | "no" => cfg.not_found = NotFoundPolicy::Fail,
                "1" | "true" | "yes" => cfg.not_found = NotFoundPolicy::Retry,
                _ => {}
            }
        }
        cfg
    }

    pub fn validate(&self) -> Result<(), WaitError> {
        if self.timeout.is_zero() {
            return Err(WaitError::InvalidConfig("timeout must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(WaitError::InvalidConfig("poll interval must be positive".into()));
        }
        if self.poll_interval >= self.timeout {
            return Err(WaitError::InvalidConfig(format!(
                "poll interval {:?} must be smaller than timeout {:?}",
                self.poll_interval, self.timeout
            )));
        }
        if !(self.error_backoff_multiplier >= 1.0 && self.error_backoff_multiplier.is_finite()) {
            return Err(WaitError::InvalidConfig(format!(
                "error backoff multiplier must be a finite value >= 1.0, got {}",
                self.error_backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Tick delay after `consecutive_errors` transient errors in a row.
    pub(crate) fn delay_after_errors(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors <= 1 || self.error_backoff_multiplier <= 1.0 {
            return self.poll_interval;
        }
        let cap = self.max_poll_interval.max(self.poll_interval).as_secs_f64();
        let factor = self.error_backoff_multiplier.powi((consecutive_errors - 1).min(64) as i32);
        Duration::from_secs_f64((self.poll_interval.as_secs_f64() * factor).min(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = WaitConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.not_found, NotFoundPolicy::Retry);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_and_oversized_interval() {
        assert!(WaitConfig::new(Duration::ZERO, Duration::from_secs(1)).validate().is_err());
        assert!(WaitConfig::new(Duration::from_secs(5), Duration::ZERO).validate().is_err());
        assert!(WaitConfig::new(Duration::from_secs(5), Duration::from_secs(5)).validate().is_err());
        assert!(WaitConfig::new(Duration::from_secs(5), Duration::from_secs(1))
            .with_error_backoff(0.5, Duration::from_secs(10))
            .validate()
            .is_err());
    }

    #[test]
    fn env_overrides_defaults() {
        let cfg = WaitConfig::from_vars(vars(&[
            ("CONVERGE_TIMEOUT_SECS", "600"),
            ("CONVERGE_POLL_INTERVAL_MS", "500"),
            ("CONVERGE_MAX_CONSECUTIVE_ERRORS", "none"),
            ("CONVERGE_ALLOW_MISSING", "false"),
        ]));
        assert_eq!(cfg.timeout, Duration::from_secs(600));
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.max_consecutive_errors, None);
        assert_eq!(cfg.not_found, NotFoundPolicy::Fail);
    }

    #[test]
    fn env_garbage_falls_back() {
        let cfg = WaitConfig::from_vars(vars(&[("CONVERGE_TIMEOUT_SECS", "soon"), ("CONVERGE_MAX_CONSECUTIVE_ERRORS", "-1")]));
        assert_eq!(cfg, WaitConfig::default());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = WaitConfig::new(Duration::from_secs(60), Duration::from_secs(1))
            .with_error_backoff(2.0, Duration::from_secs(5));
        assert_eq!(cfg.delay_after_errors(0), Duration::from_secs(1));
        assert_eq!(cfg.delay_after_errors(1), Duration::from_secs(1));
        assert_eq!(cfg.delay_after_errors(2), Duration::from_secs(2));
        assert_eq!(cfg.delay_after_errors(3), Duration::from_secs(4));
        assert_eq!(cfg.delay_after_errors(4), Duration::from_secs(5));
        assert_eq!(cfg.delay_after_errors(40), Duration::from_secs(5));
    }
}

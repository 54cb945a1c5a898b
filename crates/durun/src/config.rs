//! # Router Configuration
//!
//! Defaults, environment overrides and validation for [`Config`].
//!
//! | Setting               | Default              | Environment                     |
//! |-----------------------|----------------------|---------------------------------|
//! | `base_url`            | `http://durun.local` | `DURUN_BASE_URL`                |
//! | `request_timeout`     | 30s                  | `DURUN_REQUEST_TIMEOUT_MS`      |
//! | `idle_timeout`        | 30s                  | `DURUN_IDLE_TIMEOUT_MS`         |
//! | `eviction_interval`   | 1s                   | `DURUN_EVICTION_INTERVAL_MS`    |
//! | `alarm_poll_interval` | 50ms                 | `DURUN_ALARM_POLL_INTERVAL_MS`  |
//!
//! Blank environment values are ignored. Unparsable ones are logged and
//! ignored.

use std::fmt;
use std::time::Duration;

use http::Uri;

pub const ENV_BASE_URL: &str = "DURUN_BASE_URL";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "DURUN_REQUEST_TIMEOUT_MS";
pub const ENV_IDLE_TIMEOUT_MS: &str = "DURUN_IDLE_TIMEOUT_MS";
pub const ENV_EVICTION_INTERVAL_MS: &str = "DURUN_EVICTION_INTERVAL_MS";
pub const ENV_ALARM_POLL_INTERVAL_MS: &str = "DURUN_ALARM_POLL_INTERVAL_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A duration setting was zero.
    ZeroDuration(&'static str),
    /// The base URL is not an absolute `scheme://authority[/path]` URL.
    InvalidBaseUrl(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroDuration(field) => write!(f, "'{}' must be greater than zero", field),
            Self::InvalidBaseUrl(url) => write!(f, "Invalid base URL: {}", url),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Prefix of every routed URL: `{base_url}/do/{namespace}/{id}/{path}`.
    pub base_url: String,
    /// How long a stub waits for the router before giving up.
    pub request_timeout: Duration,
    /// Quiet period after which an instance may be evicted.
    pub idle_timeout: Duration,
    /// How often the reaper looks for idle instances.
    pub eviction_interval: Duration,
    /// Alarm scheduler tick.
    pub alarm_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://durun.local".to_string(),
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            eviction_interval: Duration::from_secs(1),
            alarm_poll_interval: Duration::from_millis(50),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Defaults overridden by the process environment, validated.
    pub fn from_env() -> Result<Self> {
        Self::builder()
            .env_overrides(|key| std::env::var(key).ok())
            .build()
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_BASE_URL) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.base_url = trimmed.to_string();
            }
        }

        let durations = [
            (ENV_REQUEST_TIMEOUT_MS, &mut self.request_timeout),
            (ENV_IDLE_TIMEOUT_MS, &mut self.idle_timeout),
            (ENV_EVICTION_INTERVAL_MS, &mut self.eviction_interval),
            (ENV_ALARM_POLL_INTERVAL_MS, &mut self.alarm_poll_interval),
        ];
        for (key, slot) in durations {
            let Some(raw) = lookup(key) else {
                continue;
            };
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.parse::<u64>() {
                Ok(ms) => *slot = Duration::from_millis(ms),
                Err(err) => tracing::warn!("invalid {key}, ignoring: {err}"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("request_timeout", self.request_timeout),
            ("idle_timeout", self.idle_timeout),
            ("eviction_interval", self.eviction_interval),
            ("alarm_poll_interval", self.alarm_poll_interval),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::ZeroDuration(*field));
        }
        self.base_uri()?;
        Ok(())
    }

    /// Path component of `base_url` without a trailing slash; empty for a
    /// bare origin.
    pub fn base_path(&self) -> String {
        self.base_uri()
            .map(|uri| uri.path().trim_end_matches('/').to_string())
            .unwrap_or_default()
    }

    fn base_uri(&self) -> Result<Uri> {
        let uri: Uri = self
            .base_url
            .parse()
            .map_err(|_| Error::InvalidBaseUrl(self.base_url.clone()))?;
        if uri.scheme().is_none() || uri.authority().is_none() || uri.query().is_some() {
            return Err(Error::InvalidBaseUrl(self.base_url.clone()));
        }
        Ok(uri)
    }
}

/// Fluent builder for [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.config.eviction_interval = interval;
        self
    }

    pub fn alarm_poll_interval(mut self, interval: Duration) -> Self {
        self.config.alarm_poll_interval = interval;
        self
    }

    pub fn env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        self.config.apply_env_overrides(lookup);
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.base_path(), "");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::builder()
            .env_overrides(env(&[
                (ENV_BASE_URL, " https://edge.example/internal/ "),
                (ENV_IDLE_TIMEOUT_MS, "1500"),
                (ENV_REQUEST_TIMEOUT_MS, ""),
                (ENV_ALARM_POLL_INTERVAL_MS, "soon"),
            ]))
            .build()
            .unwrap();

        assert_eq!(config.base_url, "https://edge.example/internal/");
        assert_eq!(config.base_path(), "/internal");
        assert_eq!(config.idle_timeout, Duration::from_millis(1500));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.alarm_poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = Config::builder()
            .eviction_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, Error::ZeroDuration("eviction_interval"));

        let err = Config::builder().base_url("durun.local").build().unwrap_err();
        assert!(matches!(err, Error::InvalidBaseUrl(_)));

        let err = Config::builder().base_url("/relative/only").build().unwrap_err();
        assert!(matches!(err, Error::InvalidBaseUrl(_)));
    }

    #[test]
    fn test_zero_from_env_fails_validation() {
        let err = Config::builder()
            .env_overrides(env(&[(ENV_REQUEST_TIMEOUT_MS, "0")]))
            .build()
            .unwrap_err();
        assert_eq!(err, Error::ZeroDuration("request_timeout"));
    }
}

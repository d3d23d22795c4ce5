//! Mutable configuration shared by every component of one factory
//!
//! Components hold a [`ConfigHandle`] and take a fresh [`Config`] snapshot
//! for each operation, so updates made through [`ConfigHandle::update`]
//! apply to the next operation without reopening anything.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use idbshim_codec::CodecConfig;

/// Default SQLite busy timeout
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay between close-completion checks
pub const DEFAULT_CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(350);

#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier escaping policy, length limit and hooks
    pub codec: CodecConfig,
    /// Log SQL text at `debug!` level
    pub debug: bool,
    pub busy_timeout: Duration,
    pub close_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            debug: false,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            close_poll_interval: DEFAULT_CLOSE_POLL_INTERVAL,
        }
    }
}

impl Config {
    /// Load configuration from `IDBSHIM_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    ///
    /// - `IDBSHIM_DEBUG`: `true`/`1` enables SQL logging
    /// - `IDBSHIM_NAME_LENGTH_LIMIT`: identifier limit, `none` disables it
    /// - `IDBSHIM_BUSY_TIMEOUT_MS`
    /// - `IDBSHIM_CLOSE_POLL_INTERVAL_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        if let Some(debug) = lookup("IDBSHIM_DEBUG") {
            config.debug = matches!(debug.to_lowercase().as_str(), "true" | "1");
        }

        if let Some(limit) = lookup("IDBSHIM_NAME_LENGTH_LIMIT") {
            if limit.eq_ignore_ascii_case("none") {
                config.codec.length_limit = None;
            } else if let Ok(limit) = limit.parse() {
                config.codec.length_limit = Some(limit);
            }
        }

        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        if let Some(timeout) = millis("IDBSHIM_BUSY_TIMEOUT_MS") {
            config.busy_timeout = timeout;
        }
        if let Some(interval) = millis("IDBSHIM_CLOSE_POLL_INTERVAL_MS") {
            config.close_poll_interval = interval;
        }

        config
    }
}

/// Shared, reloadable configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle(Arc<RwLock<Config>>);

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> Config {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `change` to the shared configuration.
    pub fn update(&self, change: impl FnOnce(&mut Config)) {
        let mut config = self.0.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[]));
        assert!(!config.debug);
        assert_eq!(config.codec.length_limit, Some(254));
        assert_eq!(config.busy_timeout, DEFAULT_BUSY_TIMEOUT);
        assert_eq!(config.close_poll_interval, DEFAULT_CLOSE_POLL_INTERVAL);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("IDBSHIM_DEBUG", "TRUE"),
            ("IDBSHIM_NAME_LENGTH_LIMIT", "none"),
            ("IDBSHIM_BUSY_TIMEOUT_MS", "250"),
            ("IDBSHIM_CLOSE_POLL_INTERVAL_MS", "10"),
        ]));
        assert!(config.debug);
        assert_eq!(config.codec.length_limit, None);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.close_poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = Config::from_lookup(lookup(&[
            ("IDBSHIM_NAME_LENGTH_LIMIT", "lots"),
            ("IDBSHIM_BUSY_TIMEOUT_MS", "-1"),
        ]));
        assert_eq!(config.codec.length_limit, Some(254));
        assert_eq!(config.busy_timeout, DEFAULT_BUSY_TIMEOUT);
    }

    #[test]
    fn test_update_is_seen_by_later_snapshots() {
        let handle = ConfigHandle::default();
        let before = handle.snapshot();
        handle.update(|cfg| cfg.debug = true);
        assert!(!before.debug);
        assert!(handle.snapshot().debug);
    }
}

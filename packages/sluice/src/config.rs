use anyhow::{ensure, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Store configuration, loadable from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// How often query caches are swept for expired entries
    pub sweep_interval: Duration,
    /// Emit a debug event for every processed action
    pub log_actions: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            log_actions: false,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables
    ///
    /// - `SLUICE_CACHE_SWEEP_MS`: sweep interval in milliseconds (default 1000)
    /// - `SLUICE_LOG_ACTIONS`: `true`/`false` (default false)
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_vars(|key| env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let sweep_interval = match var("SLUICE_CACHE_SWEEP_MS") {
            Some(ms) => {
                let ms: u64 = ms
                    .trim()
                    .parse()
                    .context("SLUICE_CACHE_SWEEP_MS must be a number of milliseconds")?;
                ensure!(ms > 0, "SLUICE_CACHE_SWEEP_MS must be greater than zero");
                Duration::from_millis(ms)
            }
            None => defaults.sweep_interval,
        };

        let log_actions = match var("SLUICE_LOG_ACTIONS") {
            Some(flag) => flag
                .trim()
                .parse()
                .context("SLUICE_LOG_ACTIONS must be true or false")?,
            None => defaults.log_actions,
        };

        Ok(Self {
            sweep_interval,
            log_actions,
        })
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn log_actions(mut self, enabled: bool) -> Self {
        self.log_actions = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = StoreConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_reads_values() {
        let config = StoreConfig::from_vars(vars(&[
            ("SLUICE_CACHE_SWEEP_MS", "250"),
            ("SLUICE_LOG_ACTIONS", "true"),
        ]))
        .unwrap();
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
        assert!(config.log_actions);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = StoreConfig::from_vars(vars(&[("SLUICE_CACHE_SWEEP_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("SLUICE_CACHE_SWEEP_MS"));

        let err = StoreConfig::from_vars(vars(&[("SLUICE_LOG_ACTIONS", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("SLUICE_LOG_ACTIONS"));
    }

    #[test]
    fn test_rejects_zero_sweep_interval() {
        let err = StoreConfig::from_vars(vars(&[("SLUICE_CACHE_SWEEP_MS", "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_builders() {
        let config = StoreConfig::default()
            .sweep_interval(Duration::from_millis(10))
            .log_actions(true);
        assert_eq!(config.sweep_interval, Duration::from_millis(10));
        assert!(config.log_actions);
    }
}

// Worker settings, passed down by the parent through the environment
use anyhow::{Context, Result};
use std::time::Duration;

pub const INVOCATION_TIMEOUT_VAR: &str = "NANOTEST_INVOCATION_TIMEOUT_MS";
pub const CANCEL_GRACE_VAR: &str = "NANOTEST_CANCEL_GRACE_MS";
pub const LOG_VAR: &str = "NANOTEST_LOG";

const DEFAULT_INVOCATION_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_CANCEL_GRACE_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Hard limit for a single launcher invocation
    pub invocation_timeout: Duration,
    pub cancel_grace: Duration,
    /// `tracing` filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_millis(DEFAULT_INVOCATION_TIMEOUT_MS),
            cancel_grace: Duration::from_millis(DEFAULT_CANCEL_GRACE_MS),
            log_filter: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; unset variables keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(INVOCATION_TIMEOUT_VAR) {
            config.invocation_timeout = parse_millis(INVOCATION_TIMEOUT_VAR, &raw)?;
        }
        if let Some(raw) = lookup(CANCEL_GRACE_VAR) {
            config.cancel_grace = parse_millis(CANCEL_GRACE_VAR, &raw)?;
        }
        if let Some(filter) = lookup(LOG_VAR).filter(|f| !f.trim().is_empty()) {
            config.log_filter = filter;
        }

        Ok(config)
    }
}

fn parse_millis(var: &str, raw: &str) -> Result<Duration> {
    let millis: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{} must be a number of milliseconds, got '{}'", var, raw))?;
    anyhow::ensure!(millis > 0, "{} must be greater than zero", var);
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.invocation_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = WorkerConfig::from_lookup(lookup(&[
            (INVOCATION_TIMEOUT_VAR, "1500"),
            (CANCEL_GRACE_VAR, " 250 "),
            (LOG_VAR, "nanotest=debug"),
        ]))
        .unwrap();

        assert_eq!(config.invocation_timeout, Duration::from_millis(1500));
        assert_eq!(config.cancel_grace, Duration::from_millis(250));
        assert_eq!(config.log_filter, "nanotest=debug");
    }

    #[test]
    fn test_rejects_bad_timeouts() {
        let err = WorkerConfig::from_lookup(lookup(&[(INVOCATION_TIMEOUT_VAR, "soon")])).unwrap_err();
        assert!(err.to_string().contains(INVOCATION_TIMEOUT_VAR));

        assert!(WorkerConfig::from_lookup(lookup(&[(CANCEL_GRACE_VAR, "0")])).is_err());
    }

    #[test]
    fn test_blank_log_filter_keeps_default() {
        let config = WorkerConfig::from_lookup(lookup(&[(LOG_VAR, "  ")])).unwrap();
        assert_eq!(config.log_filter, "info");
    }
}

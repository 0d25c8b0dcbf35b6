use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use convoy_reconcile::{AttemptStrategy, BackoffPolicy};

use crate::scheduler::SchedulerSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub scheduler: SchedulerSettings,

    /// Base URL of the discovery service. When unset, `static_hosts` is used.
    pub discovery_url: Option<String>,
    pub discovery_poll: Duration,

    /// `id=addr,id=addr` host list used without a discovery service.
    pub static_hosts: String,

    pub agent_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from a variable lookup. Intervals, timeouts and
    /// the mailbox size must be non-zero.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("CONVOY_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:7070".to_string())
            .parse()
            .context("CONVOY_LISTEN_ADDR")?;

        let log_level = lookup("CONVOY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let backoff = BackoffPolicy::new(
            Duration::from_millis(var_or(&lookup, "CONVOY_BACKOFF_PERIOD_MS", 10_000)?),
            Duration::from_millis(var_or(&lookup, "CONVOY_BACKOFF_MAX_MS", 600_000)?),
        )?;

        let attempts = AttemptStrategy {
            min_attempts: nonzero_or(&lookup, "CONVOY_ATTEMPT_MIN", 3)?,
            total: Duration::from_millis(var_or(&lookup, "CONVOY_ATTEMPT_TOTAL_MS", 30_000)?),
            delay: millis_or(&lookup, "CONVOY_ATTEMPT_DELAY_MS", 500)?,
        };

        let scheduler = SchedulerSettings {
            backoff,
            attempts,
            event_retention: var_or(&lookup, "CONVOY_EVENT_RETENTION", 10_000)?,
            mailbox_size: nonzero_or(&lookup, "CONVOY_MAILBOX_SIZE", 1024)?,
        };

        let discovery_url = lookup("CONVOY_DISCOVERY_URL").filter(|v| !v.is_empty());

        Ok(Self {
            listen_addr,
            log_level,
            scheduler,
            discovery_url,
            discovery_poll: millis_or(&lookup, "CONVOY_DISCOVERY_POLL_MS", 2_000)?,
            static_hosts: lookup("CONVOY_STATIC_HOSTS").unwrap_or_default(),
            agent_timeout: millis_or(&lookup, "CONVOY_AGENT_TIMEOUT_MS", 5_000)?,
        })
    }
}

fn var_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value.parse().with_context(|| format!("{name}={value:?}")),
        None => Ok(default),
    }
}

fn nonzero_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = var_or(lookup, name, default)?;
    if value == T::default() {
        bail!("{name} must be greater than zero");
    }
    Ok(value)
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration> {
    nonzero_or(lookup, name, default).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr.port(), 7070);
        assert_eq!(config.discovery_poll, Duration::from_secs(2));
        assert_eq!(config.scheduler.attempts.delay, Duration::from_millis(500));
        assert_eq!(config.scheduler.mailbox_size, 1024);
        assert!(config.discovery_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("CONVOY_DISCOVERY_URL", "http://discovery:8080"),
            ("CONVOY_DISCOVERY_POLL_MS", "250"),
            ("CONVOY_AGENT_TIMEOUT_MS", "1000"),
        ])
        .unwrap();
        assert_eq!(config.discovery_url.as_deref(), Some("http://discovery:8080"));
        assert_eq!(config.discovery_poll, Duration::from_millis(250));
        assert_eq!(config.agent_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for name in [
            "CONVOY_DISCOVERY_POLL_MS",
            "CONVOY_AGENT_TIMEOUT_MS",
            "CONVOY_ATTEMPT_DELAY_MS",
            "CONVOY_ATTEMPT_MIN",
            "CONVOY_MAILBOX_SIZE",
            "CONVOY_BACKOFF_PERIOD_MS",
        ] {
            let err = config(&[(name, "0")]).unwrap_err();
            assert!(
                format!("{err:#}").contains("zero"),
                "{name}: unexpected error {err:#}"
            );
        }
    }

    #[test]
    fn test_malformed_value_names_variable() {
        let err = config(&[("CONVOY_MAILBOX_SIZE", "lots")]).unwrap_err();
        assert!(format!("{err:#}").contains("CONVOY_MAILBOX_SIZE"));
    }
}

//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Dispatch configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of work items executing at once.
    pub max_concurrent: usize,
    /// Path of the declarative job list.
    pub jobs_path: PathBuf,
    /// Channel used by jobs that do not name their own.
    pub default_channel: Option<String>,
    /// How often the job list is checked for changes.
    pub reload_interval: Duration,
    /// TTL for webhook delivery ids.
    pub webhook_dedup_ttl: Duration,
    /// TTL for heartbeat-discovered items.
    pub heartbeat_dedup_ttl: Duration,
    /// Period of the dedup cache sweep.
    pub sweep_interval: Duration,
    /// Period of the heartbeat poll tick.
    pub heartbeat_interval: Duration,
    /// HTTP port for webhooks and status routes.
    pub port: u16,
    /// Shell command that executes a work item's prompt (stdin).
    pub agent_command: Option<String>,
    /// Wall-clock bound for one agent command run.
    pub agent_timeout: Duration,
    /// Shell command that lists heartbeat items as a JSON array.
    pub heartbeat_command: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            jobs_path: PathBuf::from("./cron-jobs.json"),
            default_channel: None,
            reload_interval: Duration::from_secs(30),
            webhook_dedup_ttl: Duration::from_secs(600), // 10 minutes
            heartbeat_dedup_ttl: Duration::from_secs(3600), // 1 hour
            sweep_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(300),
            port: 8080,
            agent_command: None,
            agent_timeout: Duration::from_secs(600),
            heartbeat_command: None,
        }
    }
}

impl DispatchConfig {
    /// Build the configuration from `DISPATCH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DISPATCH_MAX_CONCURRENT") {
            config.max_concurrent = parse_value("DISPATCH_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = get("DISPATCH_JOBS_PATH") {
            config.jobs_path = PathBuf::from(v);
        }
        if let Some(v) = get("DISPATCH_DEFAULT_CHANNEL") {
            config.default_channel = Some(v);
        }
        if let Some(v) = get("DISPATCH_RELOAD_INTERVAL_SECS") {
            config.reload_interval = parse_secs("DISPATCH_RELOAD_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("DISPATCH_WEBHOOK_DEDUP_TTL_SECS") {
            config.webhook_dedup_ttl = parse_secs("DISPATCH_WEBHOOK_DEDUP_TTL_SECS", &v)?;
        }
        if let Some(v) = get("DISPATCH_HEARTBEAT_DEDUP_TTL_SECS") {
            config.heartbeat_dedup_ttl = parse_secs("DISPATCH_HEARTBEAT_DEDUP_TTL_SECS", &v)?;
        }
        if let Some(v) = get("DISPATCH_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = parse_secs("DISPATCH_SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("DISPATCH_HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = parse_secs("DISPATCH_HEARTBEAT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("DISPATCH_PORT") {
            config.port = parse_value("DISPATCH_PORT", &v)?;
        }
        if let Some(v) = get("DISPATCH_AGENT_CMD") {
            config.agent_command = Some(v);
        }
        if let Some(v) = get("DISPATCH_AGENT_TIMEOUT_SECS") {
            config.agent_timeout = parse_secs("DISPATCH_AGENT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("DISPATCH_HEARTBEAT_CMD") {
            config.heartbeat_command = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the dispatch core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let durations = [
            ("reload_interval", self.reload_interval),
            ("webhook_dedup_ttl", self.webhook_dedup_ttl),
            ("heartbeat_dedup_ttl", self.heartbeat_dedup_ttl),
            ("sweep_interval", self.sweep_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("agent_timeout", self.agent_timeout),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    parse_value::<u64>(key, raw).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.webhook_dedup_ttl.as_secs(), 600);
        assert_eq!(config.heartbeat_dedup_ttl.as_secs(), 3600);
        assert!(config.default_channel.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("DISPATCH_MAX_CONCURRENT", "4"),
            ("DISPATCH_JOBS_PATH", "/etc/dispatch/jobs.json"),
            ("DISPATCH_DEFAULT_CHANNEL", "ops"),
            ("DISPATCH_RELOAD_INTERVAL_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.jobs_path, PathBuf::from("/etc/dispatch/jobs.json"));
        assert_eq!(config.default_channel.as_deref(), Some("ops"));
        assert_eq!(config.reload_interval, Duration::from_secs(5));
    }

    #[test]
    fn blank_values_are_ignored() {
        let config =
            DispatchConfig::from_lookup(lookup(&[("DISPATCH_DEFAULT_CHANNEL", "  ")])).unwrap();
        assert!(config.default_channel.is_none());
    }

    #[test]
    fn rejects_unparseable_number() {
        let err = DispatchConfig::from_lookup(lookup(&[("DISPATCH_PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "DISPATCH_PORT"));
    }

    #[test]
    fn rejects_zero_ceiling() {
        let err =
            DispatchConfig::from_lookup(lookup(&[("DISPATCH_MAX_CONCURRENT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "max_concurrent"));
    }

    #[test]
    fn rejects_zero_interval() {
        let err = DispatchConfig::from_lookup(lookup(&[("DISPATCH_SWEEP_INTERVAL_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "sweep_interval"));
    }
}

//! Daemon configuration.
//!
//! Process-level settings come from the environment. The proxy record itself
//! (ports, enabled flag) lives in the JSON config file and is watched by the
//! [`crate::controller::ConfigController`].

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::proxy::{HealthConfig, ServerOptions};

/// Daemon configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the persisted proxy configuration.
    pub config_file: PathBuf,

    /// Interface the listener binds to.
    pub bind_ip: IpAddr,

    /// How often the config file is re-read.
    pub poll_interval: Duration,

    /// Interval between health checks.
    pub health_interval: Duration,

    /// Restart attempts before giving up.
    pub max_retry_attempts: u32,

    /// Relay failures that trigger a restart.
    pub max_connection_failures: u32,

    /// Health probe connect timeout.
    pub health_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit human-readable logs instead of JSON.
    pub pretty_logs: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let config_file = std::env::var("PORTSWITCH_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_file());

        let bind_ip = std::env::var("PORTSWITCH_BIND_ADDR")
            .ok()
            .map(|v| v.parse::<IpAddr>())
            .transpose()
            .context("PORTSWITCH_BIND_ADDR must be an IP address.")?
            .unwrap_or_else(|| ServerOptions::default().bind_ip);

        let poll_interval_ms: u64 = parse_env(
            "PORTSWITCH_CONFIG_POLL_INTERVAL_MS",
            "an integer (milliseconds)",
        )?
        .unwrap_or(1000);
        let poll_interval = Duration::from_millis(poll_interval_ms.max(50));

        let defaults = HealthConfig::default();

        let health_interval = parse_env::<u64>("PORTSWITCH_HEALTH_INTERVAL_SECS", "an integer (seconds)")?
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(defaults.check_interval);

        let max_retry_attempts = parse_env("PORTSWITCH_MAX_RETRY_ATTEMPTS", "an integer")?
            .unwrap_or(defaults.max_retry_attempts);

        let max_connection_failures =
            parse_env::<u32>("PORTSWITCH_MAX_CONNECTION_FAILURES", "an integer")?
                .unwrap_or(defaults.max_connection_failures)
                .max(1);

        let health_timeout = parse_env::<u64>("PORTSWITCH_HEALTH_TIMEOUT_SECS", "an integer (seconds)")?
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(defaults.check_timeout);

        let log_level =
            std::env::var("PORTSWITCH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let pretty_logs = std::env::var("PORTSWITCH_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("pretty"))
            .unwrap_or(false);

        Ok(Self {
            config_file,
            bind_ip,
            poll_interval,
            health_interval,
            max_retry_attempts,
            max_connection_failures,
            health_timeout,
            log_level,
            pretty_logs,
        })
    }

    /// Health settings for the server; tuning constants keep their defaults.
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            check_interval: self.health_interval,
            max_retry_attempts: self.max_retry_attempts,
            max_connection_failures: self.max_connection_failures,
            check_timeout: self.health_timeout,
            ..HealthConfig::default()
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            bind_ip: self.bind_ip,
            health: self.health_config(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, expected: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .ok()
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be {expected}."))
}

fn default_config_file() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home)
            .join(".config")
            .join("portswitch")
            .join("config.json"),
        None => PathBuf::from("portswitch.json"),
    }
}

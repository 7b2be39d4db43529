//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to keep
//! credentials out of logs. Stream tuning can also come from a TOML file;
//! environment variables win over the file.

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub database_pool_size: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub app_env: String,
    pub api_host: String,
    pub api_port: u16,
    pub stream: StreamSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load configuration, layering env vars over an optional settings file.
    pub fn load(settings_file: Option<&Path>) -> Result<Self> {
        let mut stream = match settings_file {
            Some(path) => StreamSettings::from_file(path)?,
            None => StreamSettings::default(),
        };
        stream.apply_env()?;
        stream.validate()?;

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            database_pool_size: parsed_var("DATABASE_POOL_SIZE")?.unwrap_or(10),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            app_env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            api_host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: parsed_var("API_PORT")?.unwrap_or(8000),
            stream,
        })
    }

    /// Address the HTTP server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

/// Tuning for subscriptions: cadence, limits and failure budget.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSettings {
    /// Delay between polls. Also the latency floor of the stream.
    pub poll_interval_ms: u64,
    /// Delay between heartbeats, independent of activity.
    pub heartbeat_secs: u64,
    /// Records replayed to a fresh subscription.
    pub backlog_limit: usize,
    /// Upper bound on records read per subsequence per poll.
    pub page_cap: usize,
    /// Consecutive failed polls tolerated before the subscription closes.
    pub max_poll_failures: u32,
    /// Timeout applied to each individual store query.
    pub store_timeout_ms: u64,
    /// Events buffered between a subscription and its connection.
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            heartbeat_secs: 30,
            backlog_limit: 20,
            page_cap: 200,
            max_poll_failures: 5,
            store_timeout_ms: 5000,
            channel_capacity: 64,
        }
    }
}

impl StreamSettings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid stream settings: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Override fields from `STREAM_*` environment variables that are set.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = parsed_var("STREAM_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = parsed_var("STREAM_HEARTBEAT_SECS")? {
            self.heartbeat_secs = v;
        }
        if let Some(v) = parsed_var("STREAM_BACKLOG_LIMIT")? {
            self.backlog_limit = v;
        }
        if let Some(v) = parsed_var("STREAM_PAGE_CAP")? {
            self.page_cap = v;
        }
        if let Some(v) = parsed_var("STREAM_MAX_POLL_FAILURES")? {
            self.max_poll_failures = v;
        }
        if let Some(v) = parsed_var("STREAM_STORE_TIMEOUT_MS")? {
            self.store_timeout_ms = v;
        }
        if let Some(v) = parsed_var("STREAM_CHANNEL_CAPACITY")? {
            self.channel_capacity = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("poll_interval_ms", self.poll_interval_ms == 0),
            ("heartbeat_secs", self.heartbeat_secs == 0),
            ("page_cap", self.page_cap == 0),
            ("max_poll_failures", self.max_poll_failures == 0),
            ("store_timeout_ms", self.store_timeout_ms == 0),
            ("channel_capacity", self.channel_capacity == 0),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, zero)| *zero) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("environment variable {name} is invalid: {raw}"))),
        Err(_) => Ok(None),
    }
}

//! Agent configuration: environment, `.env`, and command-line overrides.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use clap::Parser;
use regex::Regex;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod env_vars {
    pub const CONNECTION_STRING: &str = "IOTHUB_DEVICE_CONNECTION_STRING";
    pub const BUFFER_DIR: &str = "TELEMETRY_BUFFER_DIR";
    pub const LOG_DIR: &str = "TELEMETRY_LOG_DIR";
    pub const PROBE_ADDR: &str = "TELEMETRY_PROBE_ADDR";
    pub const PROBE_TIMEOUT_MS: &str = "TELEMETRY_PROBE_TIMEOUT_MS";
    pub const ALERT_THRESHOLD: &str = "TELEMETRY_ALERT_THRESHOLD";
    pub const SAS_TTL_SECS: &str = "TELEMETRY_SAS_TTL_SECS";
    pub const BLOB_ENDPOINT: &str = "TELEMETRY_BLOB_ENDPOINT";
}

pub const DEFAULT_TIME_INTERVAL_SECS: u64 = 3;
pub const DEFAULT_ALERT_THRESHOLD: f64 = 35.0;
const DEFAULT_PROBE_ADDR: &str = "8.8.8.8:53";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_SAS_TTL_SECS: u64 = 3600;

/// Placeholder used when the connection string carries no `DeviceId=` token.
pub const UNKNOWN_DEVICE_ID: &str = "Not found";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingVar(&'static str),

    #[error("connection string is missing {0}")]
    MissingField(&'static str),

    #[error("shared access key is not valid base64: {0}")]
    InvalidKey(String),
}

/// Simulated sensor agent that streams readings to IoT Hub.
#[derive(Debug, Parser)]
#[command(name = "telemetry-agent")]
#[command(about = "Streams simulated readings and buffers them through network outages", long_about = None)]
pub struct Cli {
    /// Telemetry time interval in seconds
    #[arg(long = "time_interval")]
    pub time_interval: Option<u64>,
}

/// Parsed device connection string.
#[derive(Clone)]
pub struct DeviceCredential {
    pub host_name: String,
    pub device_id: String,
    /// Decoded shared access key bytes
    pub key: Vec<u8>,
}

impl std::fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DeviceCredential {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = env::var(env_vars::CONNECTION_STRING)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingVar(env_vars::CONNECTION_STRING))?;
        Self::parse(&raw)
    }

    /// Parse `HostName=..;DeviceId=..;SharedAccessKey=..`.
    pub fn parse(connection_string: &str) -> Result<Self, ConfigError> {
        let mut host_name = None;
        let mut key = None;

        for part in connection_string.split(';') {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            match name.trim() {
                "HostName" => host_name = Some(value.trim().to_string()),
                "SharedAccessKey" => key = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let host_name = host_name.ok_or(ConfigError::MissingField("HostName"))?;
        let key = key.ok_or(ConfigError::MissingField("SharedAccessKey"))?;
        let key = BASE64
            .decode(key.as_bytes())
            .map_err(|e| ConfigError::InvalidKey(e.to_string()))?;

        Ok(Self {
            host_name,
            device_id: extract_device_id(connection_string),
            key,
        })
    }
}

/// Pull the `DeviceId=<value>;` token out of a connection string.
pub fn extract_device_id(connection_string: &str) -> String {
    let re = Regex::new(r"DeviceId=([^;]+);").expect("static regex");
    re.captures(connection_string)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_DEVICE_ID.to_string())
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub time_interval: Duration,
    pub buffer_dir: PathBuf,
    pub log_dir: PathBuf,
    pub probe_addr: String,
    pub probe_timeout: Duration,
    pub alert_threshold: f64,
    pub sas_ttl: Duration,
    /// Storage endpoint replacing the host the hub hands out, e.g. a local
    /// emulator at `http://127.0.0.1:10000/devstoreaccount1`
    pub blob_endpoint: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            time_interval: Duration::from_secs(DEFAULT_TIME_INTERVAL_SECS),
            buffer_dir: PathBuf::from("."),
            log_dir: PathBuf::from("logs"),
            probe_addr: DEFAULT_PROBE_ADDR.to_string(),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            sas_ttl: Duration::from_secs(DEFAULT_SAS_TTL_SECS),
            blob_endpoint: None,
        }
    }
}

impl AgentConfig {
    pub fn from_env(cli: &Cli) -> Self {
        let defaults = Self::default();

        let time_interval = cli
            .time_interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.time_interval);

        let config = Self {
            time_interval,
            buffer_dir: env::var(env_vars::BUFFER_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.buffer_dir),
            log_dir: env::var(env_vars::LOG_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            probe_addr: env::var(env_vars::PROBE_ADDR).unwrap_or(defaults.probe_addr),
            probe_timeout: env::var(env_vars::PROBE_TIMEOUT_MS)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            alert_threshold: env::var(env_vars::ALERT_THRESHOLD)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.alert_threshold),
            sas_ttl: env::var(env_vars::SAS_TTL_SECS)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.sas_ttl),
            blob_endpoint: env::var(env_vars::BLOB_ENDPOINT)
                .ok()
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty()),
        };

        config.clamped()
    }

    /// Keep the probe well inside one tick so it never becomes the bottleneck.
    pub fn clamped(mut self) -> Self {
        let ceiling = self.time_interval / 2;
        if self.probe_timeout > ceiling {
            self.probe_timeout = ceiling.max(Duration::from_millis(100));
        }
        self
    }
}

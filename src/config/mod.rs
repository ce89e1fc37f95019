use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::pool::PoolConfig;

/// Remote service endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Service host (default: localhost)
    #[serde(default = "default_host")]
    pub host: String,

    /// Service port (default: 38080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    38080
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Sessions kept for reuse; you probably want at least 1
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Extra sessions opened when all pooled ones are busy (0 disables)
    #[serde(default = "default_max_overflow")]
    pub max_overflow: usize,

    /// How long an acquire waits on an exhausted pool, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,
}

fn default_pool_size() -> usize {
    5
}

fn default_max_overflow() -> usize {
    10
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_overflow: default_max_overflow(),
            acquire_timeout_ms: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub pool: PoolSettings,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// `host:port` of the remote service
    pub fn address(&self) -> String {
        format!("{}:{}", self.remote.host, self.remote.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.host.trim().is_empty() {
            anyhow::bail!("Remote host must not be empty");
        }
        if self.remote.port == 0 {
            anyhow::bail!("Remote port must not be 0");
        }
        if self.remote.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than 0");
        }
        if self.pool.acquire_timeout_ms == Some(0) {
            anyhow::bail!("acquire_timeout_ms must be greater than 0 when set");
        }
        self.pool_config()
            .validate()
            .context("Invalid pool settings")?;
        Ok(())
    }

    /// Pool parameters derived from this configuration
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            capacity: self.pool.pool_size,
            overflow_limit: self.pool.max_overflow,
            connect_timeout: Duration::from_millis(self.remote.connect_timeout_ms),
            acquire_timeout: self.pool.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    config.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// All variables are optional:
/// - HYPERTABLE_HOST (default localhost)
/// - HYPERTABLE_PORT (default 38080)
/// - HYPERTABLE_POOL_SIZE (default 5)
/// - HYPERTABLE_MAX_OVERFLOW (default 10, 0 disables overflow)
/// - HYPERTABLE_CONNECT_TIMEOUT_MS (default 5000)
/// - HYPERTABLE_ACQUIRE_TIMEOUT_MS (default: wait indefinitely)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    load_from_vars(|name| std::env::var(name).ok())
}

/// Build a configuration from a variable lookup, see [`load_from_env`]
pub fn load_from_vars<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = Config::new();

    if let Some(host) = lookup("HYPERTABLE_HOST") {
        config.remote.host = host.trim().to_string();
    }

    if let Some(port) = lookup("HYPERTABLE_PORT") {
        config.remote.port = port
            .trim()
            .parse()
            .context(format!("Invalid HYPERTABLE_PORT: {:?}", port))?;
    }

    if let Some(size) = lookup("HYPERTABLE_POOL_SIZE") {
        config.pool.pool_size = parse_count("HYPERTABLE_POOL_SIZE", &size)?;
    }

    if let Some(overflow) = lookup("HYPERTABLE_MAX_OVERFLOW") {
        config.pool.max_overflow = parse_count("HYPERTABLE_MAX_OVERFLOW", &overflow)?;
    }

    if let Some(timeout) = lookup("HYPERTABLE_CONNECT_TIMEOUT_MS") {
        config.remote.connect_timeout_ms = timeout
            .trim()
            .parse()
            .context(format!("Invalid HYPERTABLE_CONNECT_TIMEOUT_MS: {:?}", timeout))?;
    }

    if let Some(timeout) = lookup("HYPERTABLE_ACQUIRE_TIMEOUT_MS") {
        let timeout = timeout
            .trim()
            .parse()
            .context(format!("Invalid HYPERTABLE_ACQUIRE_TIMEOUT_MS: {:?}", timeout))?;
        config.pool.acquire_timeout_ms = Some(timeout);
    }

    config.validate()?;
    Ok(config)
}

fn parse_count(name: &str, value: &str) -> Result<usize> {
    let parsed: i64 = value
        .trim()
        .parse()
        .context(format!("Invalid {}: {:?}", name, value))?;
    if parsed < 0 {
        anyhow::bail!("Please specify {} >= 0", name);
    }
    usize::try_from(parsed).context(format!("{} is too large", name))
}

/// Load configuration from file or environment
///
/// Loads from the YAML file when a path is given, otherwise from environment
/// variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}

//! Environment-driven server configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PATH: &str = "/ws";
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Endpoint path accepting upgrades, without trailing slash
    pub path: String,
    /// Server ping period. `None` disables keepalive.
    pub ping_interval: Option<Duration>,
    pub pong_timeout: Duration,
    /// Frames buffered per connection before it counts as stalled and is dropped
    pub queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT),
            path: DEFAULT_PATH.to_string(),
            ping_interval: None,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RelayConfig {
    /// Read `PORT`, `RELAY_HOST`, `RELAY_PATH`, `RELAY_PING_INTERVAL_SECS`,
    /// `RELAY_PONG_TIMEOUT_SECS` and `RELAY_QUEUE_CAPACITY`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port: u16 = parse_var(&lookup, "PORT")?.unwrap_or(DEFAULT_PORT);
        let host = lookup("RELAY_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());

        let path = match lookup("RELAY_PATH") {
            Some(path) => normalize_path(&path).to_string(),
            None => DEFAULT_PATH.to_string(),
        };

        let ping_interval = parse_var::<u64>(&lookup, "RELAY_PING_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let pong_timeout = parse_var::<u64>(&lookup, "RELAY_PONG_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PONG_TIMEOUT);

        let queue_capacity = match parse_var::<usize>(&lookup, "RELAY_QUEUE_CAPACITY")? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    var: "RELAY_QUEUE_CAPACITY",
                    value: "0".to_string(),
                });
            }
            Some(capacity) => capacity,
            None => DEFAULT_QUEUE_CAPACITY,
        };

        Ok(Self {
            bind_addr: format!("{}:{}", host, port),
            path,
            ping_interval,
            pong_timeout,
            queue_capacity,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

/// Strip one trailing slash, keeping the root path as `/`
pub fn normalize_path(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some("") | None => path,
        Some(stripped) => stripped,
    }
}

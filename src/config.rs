//! Configuration shared by the server, the knock service and the client
//!
//! Loaded from an optional JSON file. Every field has a default, so a missing
//! file or a partial one is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::challenge::batch_tuple_count;
use crate::error::ServiceError;
use crate::key::{Port, MAX_RANGE_SIZE, MAX_TUPLE_LEN};

/// Default first port of the knock range
pub const DEFAULT_PORT_BASE: Port = 21380;

/// Default number of ports in the knock range
pub const DEFAULT_PORT_RANGE: u16 = 10;

/// Default address of the challenge server
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8080";

/// Port knocking configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// First port of the range
    pub port_base: Port,

    /// Number of ports in the range
    pub port_range: u16,

    /// Ports per tuple, half the range when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuple_size: Option<usize>,

    /// Expected percentage of client ports that fail to bind
    pub tolerance: u32,

    /// Percent chance of skipping a combination when issuing
    pub skip_probability: u32,

    /// Session lifetime in seconds
    pub session_ttl_secs: u64,

    /// Knock inactivity timeout in milliseconds
    pub knock_ttl_ms: u64,

    /// Period of the expiry sweeps in milliseconds
    pub sweep_interval_ms: u64,

    /// Client pause between two knocks in milliseconds
    pub knock_interval_ms: u64,

    /// Period of the knock service metrics log in seconds, 0 disables it
    pub metrics_interval_secs: u64,

    /// Address of the challenge server
    pub http_addr: String,

    /// Directory holding the client marker files
    pub marker_dir: PathBuf,

    /// How long the client waits for confirmation, in seconds
    pub confirm_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_base: DEFAULT_PORT_BASE,
            port_range: DEFAULT_PORT_RANGE,
            tuple_size: None,
            tolerance: 20,
            skip_probability: 2,
            session_ttl_secs: 10,
            knock_ttl_ms: 2000,
            sweep_interval_ms: 500,
            knock_interval_ms: 10,
            metrics_interval_secs: 60,
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            marker_dir: PathBuf::from("/tmp"),
            confirm_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ServiceError> {
        let config = match path {
            Some(path) => {
                debug!("Loading config from {:?}", path);
                let content = std::fs::read_to_string(path)?;
                let config: Config = serde_json::from_str(&content)?;
                info!("Loaded config from {:?}", path);
                config
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and derived values.
    pub fn validate(&self) -> Result<(), ServiceError> {
        let range = usize::from(self.port_range);
        if range == 0 || range > MAX_RANGE_SIZE {
            return Err(ServiceError::Config(format!(
                "port_range must be in 1..={MAX_RANGE_SIZE}, got {range}"
            )));
        }
        if u32::from(self.port_base) + u32::from(self.port_range) > u32::from(Port::MAX) {
            return Err(ServiceError::Config(format!(
                "port range {}+{} ends past port 65534",
                self.port_base, self.port_range
            )));
        }
        let tuple_size = self.tuple_size();
        if tuple_size == 0 || tuple_size > MAX_TUPLE_LEN || tuple_size > range {
            return Err(ServiceError::Config(format!(
                "tuple_size must be in 1..={}, got {tuple_size}",
                MAX_TUPLE_LEN.min(range)
            )));
        }
        if self.skip_probability >= 100 {
            return Err(ServiceError::Config(format!(
                "skip_probability must be below 100, got {}",
                self.skip_probability
            )));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ServiceError::Config("sweep_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Ports per tuple.
    pub fn tuple_size(&self) -> usize {
        self.tuple_size.unwrap_or(usize::from(self.port_range) / 2)
    }

    /// Tuples issued per challenge, including tolerance spares.
    pub fn tuples_per_challenge(&self) -> usize {
        batch_tuple_count(self.tolerance, self.tuple_size())
    }

    /// All ports of the range in ascending order.
    pub fn ports(&self) -> Vec<Port> {
        (0..self.port_range)
            .map(|offset| self.port_base + offset)
            .collect()
    }

    /// Session lifetime.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Knock inactivity timeout.
    pub fn knock_ttl(&self) -> Duration {
        Duration::from_millis(self.knock_ttl_ms)
    }

    /// Period of the expiry sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Client pause between two knocks.
    pub fn knock_interval(&self) -> Duration {
        Duration::from_millis(self.knock_interval_ms)
    }

    /// Period of the knock service metrics log.
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    /// Client wait for marker removal.
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }
}

/// What a knock binary was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run with the configuration at the optional path
    Run(Option<PathBuf>),
    /// Print usage and exit
    Help,
}

/// Parse `--config <path>` and `--help` from the arguments after the program name.
pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command, ServiceError> {
    let mut path = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args
                    .next()
                    .ok_or_else(|| ServiceError::Config("--config requires a path".into()))?;
                path = Some(PathBuf::from(value));
            }
            "--help" | "-h" => return Ok(Command::Help),
            other => return Err(ServiceError::Config(format!("unknown argument {other:?}"))),
        }
    }
    Ok(Command::Run(path))
}

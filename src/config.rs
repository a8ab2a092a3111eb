use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const ENV_PREFIX: &str = "NODEFLOW_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml_bw::Error },
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

/// What to do with an asynchronous node output when the output queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the message with a warning; the producing node never stalls.
    #[default]
    Drop,
    /// Wait up to `queues.block_timeout_ms`, then drop.
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub request_threads: usize,
    pub response_threads: usize,
    pub output_threads: usize,
    pub capacity: usize,
    pub block_timeout_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            request_threads: 10,
            response_threads: 10,
            output_threads: 10,
            capacity: 1000,
            block_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub socket_path: PathBuf,
    pub nodes_path: PathBuf,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    /// OTLP/HTTP collector for logs and metrics; nothing is exported when unset.
    pub otel_endpoint: Option<String>,
    pub queues: QueueSettings,
    /// Below 1000 the watchdog is disabled.
    pub watchdog_timeout_ms: u64,
    pub node_input_history_size: usize,
    pub max_connections: usize,
    pub rpc_timeout_ms: u64,
    pub connect_retry_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub output_overflow: OverflowPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/nodeflow/flows.sock"),
            nodes_path: PathBuf::from("./nodes"),
            log_level: "info".to_string(),
            log_dir: None,
            otel_endpoint: None,
            queues: QueueSettings::default(),
            watchdog_timeout_ms: 0,
            node_input_history_size: 10,
            max_connections: 20,
            rpc_timeout_ms: 10_000,
            connect_retry_delay_ms: 1000,
            shutdown_timeout_ms: 30_000,
            output_overflow: OverflowPolicy::Drop,
        }
    }
}

impl RuntimeConfig {
    /// File (if given) first, then `.env` and `NODEFLOW_*` variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if dotenvy::dotenv().is_ok() {
            info!("loaded .env");
        }
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml_bw::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay values from a variable lookup (`NODEFLOW_SOCKET_PATH`, ...).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("SOCKET_PATH") {
            self.socket_path = PathBuf::from(v);
        }
        if let Some(v) = get("NODES_PATH") {
            self.nodes_path = PathBuf::from(v);
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(v).filter(|v| !v.trim().is_empty());
        }
        parse_into(&get, "REQUEST_THREADS", &mut self.queues.request_threads)?;
        parse_into(&get, "RESPONSE_THREADS", &mut self.queues.response_threads)?;
        parse_into(&get, "OUTPUT_THREADS", &mut self.queues.output_threads)?;
        parse_into(&get, "QUEUE_CAPACITY", &mut self.queues.capacity)?;
        parse_into(&get, "QUEUE_BLOCK_TIMEOUT_MS", &mut self.queues.block_timeout_ms)?;
        parse_into(&get, "WATCHDOG_TIMEOUT_MS", &mut self.watchdog_timeout_ms)?;
        parse_into(&get, "NODE_INPUT_HISTORY_SIZE", &mut self.node_input_history_size)?;
        parse_into(&get, "MAX_CONNECTIONS", &mut self.max_connections)?;
        parse_into(&get, "RPC_TIMEOUT_MS", &mut self.rpc_timeout_ms)?;
        parse_into(&get, "CONNECT_RETRY_DELAY_MS", &mut self.connect_retry_delay_ms)?;
        parse_into(&get, "SHUTDOWN_TIMEOUT_MS", &mut self.shutdown_timeout_ms)?;
        if let Some(v) = get("OUTPUT_OVERFLOW") {
            self.output_overflow = match v.to_ascii_lowercase().as_str() {
                "drop" => OverflowPolicy::Drop,
                "block" => OverflowPolicy::Block,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: format!("{ENV_PREFIX}OUTPUT_OVERFLOW"),
                        value: v,
                    });
                }
            };
        }
        self.sanitize();
        Ok(())
    }

    fn sanitize(&mut self) {
        for (name, threads) in [
            ("request", &mut self.queues.request_threads),
            ("response", &mut self.queues.response_threads),
            ("output", &mut self.queues.output_threads),
        ] {
            if *threads == 0 {
                warn!(queue = name, "thread count 0 is not allowed, using 1");
                *threads = 1;
            }
        }
        if self.queues.capacity == 0 {
            self.queues.capacity = 1;
        }
    }

    /// `None` when the configured timeout is too short to be meaningful.
    pub fn watchdog_timeout(&self) -> Option<Duration> {
        (self.watchdog_timeout_ms >= 1000).then(|| Duration::from_millis(self.watchdog_timeout_ms))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.queues.block_timeout_ms)
    }
}

fn parse_into<T, G>(get: &G, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: format!("{ENV_PREFIX}{name}"),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

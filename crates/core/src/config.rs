use crate::models::{CommandFamily, CommandName};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a file bridge instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Directory shared with the terminal (usually its `MQL5/Files` folder).
    pub base_dir: PathBuf,
    /// Name of the command file inside `base_dir`.
    pub command_file: String,
    /// Name of the response file inside `base_dir`.
    pub response_file: String,
    /// How often queued commands and heartbeats are flushed.
    pub submit_interval_ms: u64,
    /// How often the response file is checked. Shorter than the submit interval.
    pub collect_interval_ms: u64,
    /// Send a `ping` whenever the bridge is idle.
    pub keep_alive: bool,
    pub timeouts: TimeoutConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("bridge"),
            command_file: "command.json".to_string(),
            response_file: "response.json".to_string(),
            submit_interval_ms: 1_000,
            collect_interval_ms: 200,
            keep_alive: false,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn command_path(&self) -> PathBuf {
        self.base_dir.join(&self.command_file)
    }

    pub fn response_path(&self) -> PathBuf {
        self.base_dir.join(&self.response_file)
    }

    pub fn submit_interval(&self) -> Duration {
        Duration::from_millis(self.submit_interval_ms)
    }

    pub fn collect_interval(&self) -> Duration {
        Duration::from_millis(self.collect_interval_ms)
    }
}

/// Per-family response timeouts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Used when a family has no timeout of its own.
    pub default_ms: u64,
    /// Balance, order listings, ping.
    pub query_ms: Option<u64>,
    /// Order placement, closes, modifications. A broker fill can be slow.
    pub trade_ms: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_ms: 10_000,
            query_ms: Some(5_000),
            trade_ms: Some(30_000),
        }
    }
}

impl TimeoutConfig {
    pub fn for_family(&self, family: CommandFamily) -> Duration {
        let ms = match family {
            CommandFamily::Query => self.query_ms,
            CommandFamily::Trade => self.trade_ms,
        };
        Duration::from_millis(ms.unwrap_or(self.default_ms))
    }

    pub fn for_command(&self, name: CommandName) -> Duration {
        self.for_family(name.family())
    }
}

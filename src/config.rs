use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Days of future slots the daily generation sweep covers.
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: i64,
    /// Maximum due notifications drained per dispatch tick.
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: i64,
    #[serde(default = "default_dispatch_tick_secs")]
    pub dispatch_tick_secs: u64,
    /// Sent notifications older than this many days are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

fn default_lookahead_days() -> i64 {
    1
}
fn default_dispatch_batch_size() -> i64 {
    100
}
fn default_dispatch_tick_secs() -> u64 {
    60
}
fn default_retention_days() -> i64 {
    7
}
fn default_delivery_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lookahead_days: default_lookahead_days(),
            dispatch_batch_size: default_dispatch_batch_size(),
            dispatch_tick_secs: default_dispatch_tick_secs(),
            retention_days: default_retention_days(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Config::default()),
        }
    }
}

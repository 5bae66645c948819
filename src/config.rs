use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::follower::FollowerConfig;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9090";
const DEFAULT_GRACE_PERIOD_MS: u64 = 1_000;
const DEFAULT_START_AT_END: bool = true;

/// Settings of the `prooftail` binary.
///
/// Loaded from a TOML file, every field except `log_path` has a default:
///
/// ```toml
/// log_path = "/var/log/miner.log"
/// listen_addr = "0.0.0.0:9090"
/// grace_period_ms = 1000
/// # skip content that exists at startup
/// start_at_end = true
/// ```
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub log_path: PathBuf,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_start_at_end")]
    pub start_at_end: bool,
}

fn default_listen_addr() -> SocketAddr {
    DEFAULT_LISTEN_ADDR
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9090)))
}

fn default_grace_period_ms() -> u64 {
    DEFAULT_GRACE_PERIOD_MS
}

fn default_start_at_end() -> bool {
    DEFAULT_START_AT_END
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_path: PathBuf::new(),
            listen_addr: default_listen_addr(),
            grace_period_ms: default_grace_period_ms(),
            start_at_end: default_start_at_end(),
        }
    }
}

impl Settings {
    /// Read settings from a TOML file. `log_path` may be left out and supplied later.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(raw)?;
        Ok(settings)
    }

    /// Check that settings are complete enough to start tailing.
    pub fn validate(&self) -> Result<()> {
        if self.log_path.as_os_str().is_empty() {
            anyhow::bail!("log_path must be set either in the config file or with --path");
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn follower_config(&self) -> FollowerConfig {
        FollowerConfig {
            grace_period: self.grace_period(),
            start_at_end: self.start_at_end,
        }
    }
}

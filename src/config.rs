//! Server configuration
//!
//! Precedence, lowest to highest: built-in defaults, TOML file (`--config`),
//! command-line flags / `TXCONSOLE_*` environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::{ConsoleError, Result};
use crate::query::DEFAULT_MAX_PAGE_SIZE;
use crate::store::{StoreConfig, WalConfig};
use crate::sweep::SweepConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP console binds to
    pub bind_addr: SocketAddr,
    /// Directory for the WAL and snapshot
    pub data_dir: PathBuf,
    /// Bounded wait for a per-xid lock before a command fails with `Busy`
    pub lock_wait_ms: u64,
    /// Upper bound on `pageSize`
    pub max_page_size: u32,
    /// How long terminal sessions are kept after their last change
    pub retention_ms: u64,
    pub sweep_interval_ms: u64,
    pub wal: WalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7091)),
            data_dir: PathBuf::from("./data"),
            lock_wait_ms: 500,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            retention_ms: 10 * 60 * 1000,
            sweep_interval_ms: 5_000,
            wal: WalConfig::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ConsoleError::InvalidArgument(format!("invalid config: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Defaults, then the optional file, then explicit flags
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        args.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_page_size == 0 {
            return Err(ConsoleError::InvalidArgument("max_page_size must be positive".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConsoleError::InvalidArgument("sweep_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            lock_wait: Duration::from_millis(self.lock_wait_ms),
            wal: self.wal.clone(),
            ..StoreConfig::default()
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: Duration::from_millis(self.sweep_interval_ms),
            retention: Duration::from_millis(self.retention_ms),
        }
    }
}

/// txconsole: distributed transaction session console
#[derive(Debug, Default, Parser)]
#[command(name = "txconsole", about = "Distributed transaction session console", version)]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "TXCONSOLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind the HTTP console to
    #[arg(short, long = "bind", env = "TXCONSOLE_BIND")]
    pub bind_addr: Option<SocketAddr>,

    /// Data directory for the session WAL and snapshot
    #[arg(short, long, env = "TXCONSOLE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Per-session lock wait in milliseconds
    #[arg(long, env = "TXCONSOLE_LOCK_WAIT_MS")]
    pub lock_wait_ms: Option<u64>,

    /// Maximum page size accepted by queries
    #[arg(long, env = "TXCONSOLE_MAX_PAGE_SIZE")]
    pub max_page_size: Option<u32>,

    /// Retention of finished sessions in milliseconds
    #[arg(long, env = "TXCONSOLE_RETENTION_MS")]
    pub retention_ms: Option<u64>,

    /// fsync every WAL batch instead of deferring
    #[arg(long)]
    pub sync_wal: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(addr) = self.bind_addr {
            config.bind_addr = addr;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(ms) = self.lock_wait_ms {
            config.lock_wait_ms = ms;
        }
        if let Some(size) = self.max_page_size {
            config.max_page_size = size;
        }
        if let Some(ms) = self.retention_ms {
            config.retention_ms = ms;
        }
        if self.sync_wal {
            config.wal = WalConfig {
                checkpoint_threshold_bytes: config.wal.checkpoint_threshold_bytes,
                ..WalConfig::synchronous()
            };
        }
    }
}

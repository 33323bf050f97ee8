//! Configuration loading

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rmfs_core::MountConfig;
use serde::{Deserialize, Serialize};

/// Main configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How to reach the device
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Filesystem behaviour
    #[serde(default)]
    pub mount: MountConfig,

    /// Seconds between background flushes of pending changes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Seconds between re-reads of the record store (0 = never)
    #[serde(default)]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Device address (default: the USB network address)
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_user")]
    pub user: String,

    /// Document store directory on the device
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// ssh binary to run
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Run once after connecting, so the device UI does not write to the
    /// store while it is mounted
    #[serde(default = "default_stop_command")]
    pub stop_command: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            user: default_user(),
            data_dir: default_data_dir(),
            ssh_program: default_ssh_program(),
            connect_timeout_secs: default_connect_timeout(),
            stop_command: default_stop_command(),
        }
    }
}

fn default_host() -> String {
    "10.11.99.1".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/home/root/.local/share/remarkable/xochitl")
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_stop_command() -> Vec<String> {
    ["systemctl", "stop", "xochitl"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_flush_interval() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            mount: MountConfig::default(),
            flush_interval_secs: default_flush_interval(),
            refresh_interval_secs: 0,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file. A missing file means defaults.
    pub fn load(config_file: &Path) -> Result<Self> {
        if config_file.exists() {
            let content = std::fs::read_to_string(config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", config_file))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            Ok(Config::default())
        }
    }
}

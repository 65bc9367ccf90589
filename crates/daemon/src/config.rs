// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - Daemon Config Module
// Where the supervisor keeps its files and which SSH client it runs (daemon.toml).
// Tunnel settings live in ssh-revtunnel-common::settings.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use ssh_revtunnel_common::JsonSettingsFile;
use tracing::info;

const APP_DIR: &str = "ssh-revtunnel";

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// JSON tunnel settings file
    /// Default: ~/.ssh_tunnel_manager.json
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    /// Log file, appended to alongside console output
    /// Default: ~/.ssh_tunnel_manager.log
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// PID file guarding against a second supervisor
    #[serde(default = "default_pid_path")]
    pub pid_path: PathBuf,

    /// SSH client executable, looked up on PATH unless absolute
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_settings_path() -> PathBuf {
    JsonSettingsFile::default_path()
        .unwrap_or_else(|_| home_dir().join(".ssh_tunnel_manager.json"))
}

fn default_log_path() -> PathBuf {
    home_dir().join(".ssh_tunnel_manager.log")
}

fn default_pid_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("daemon.pid")
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            settings_path: default_settings_path(),
            log_path: default_log_path(),
            pid_path: default_pid_path(),
            ssh_program: default_ssh_program(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.ssh_program.trim().is_empty() {
            anyhow::bail!("ssh_program must not be empty");
        }
        if self.settings_path.as_os_str().is_empty() {
            anyhow::bail!("settings_path must not be empty");
        }
        if self.pid_path.as_os_str().is_empty() {
            anyhow::bail!("pid_path must not be empty");
        }
        Ok(())
    }

    /// Load the daemon configuration
    ///
    /// An explicitly given file must exist. The default file is optional and
    /// its absence means defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        let config_path = Self::config_path()?;
        if !config_path.exists() {
            info!(
                "No daemon configuration at {}, using defaults",
                config_path.display()
            );
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Load and validate a daemon configuration file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("Failed to read daemon configuration {}", path.display())
        })?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", path.display());
        Ok(config)
    }

    /// Get the path to the default daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join(APP_DIR).join("daemon.toml"))
    }
}

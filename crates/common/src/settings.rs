// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - Settings Module
// Persisted tunnel settings and the provider the controller reads and writes

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{
    default_connect_time, default_disconnect_time, default_forward_port,
    default_max_reconnect_attempts, default_reconnect_delay, default_ssh_port,
    format_time_of_day, parse_time_of_day, TunnelConfig,
};
use crate::error::{Error, Result};

/// On-disk settings record
///
/// Field names are kept stable so existing settings files keep loading.
/// Times of day are stored as `"HH:MM"` strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PersistedSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub auto_reconnect: bool,
    pub scheduled_connect: bool,
    pub connect_time_str: String,
    pub disconnect_time_str: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: u64,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: String::new(),
            key_path: String::new(),
            local_port: default_forward_port(),
            remote_port: default_forward_port(),
            auto_reconnect: true,
            scheduled_connect: false,
            connect_time_str: format_time_of_day(&default_connect_time()),
            disconnect_time_str: format_time_of_day(&default_disconnect_time()),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl From<&TunnelConfig> for PersistedSettings {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.ssh_port,
            username: config.username.clone(),
            key_path: config.private_key_path.to_string_lossy().into_owned(),
            local_port: config.local_port,
            remote_port: config.remote_port,
            auto_reconnect: config.auto_reconnect,
            scheduled_connect: config.scheduled_connect,
            connect_time_str: format_time_of_day(&config.connect_time),
            disconnect_time_str: format_time_of_day(&config.disconnect_time),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay_secs,
        }
    }
}

impl TryFrom<PersistedSettings> for TunnelConfig {
    type Error = Error;

    fn try_from(settings: PersistedSettings) -> Result<Self> {
        Ok(Self {
            host: settings.host,
            ssh_port: settings.port,
            username: settings.username,
            private_key_path: PathBuf::from(settings.key_path),
            local_port: settings.local_port,
            remote_port: settings.remote_port,
            auto_reconnect: settings.auto_reconnect,
            scheduled_connect: settings.scheduled_connect,
            connect_time: parse_time_of_day(&settings.connect_time_str)?,
            disconnect_time: parse_time_of_day(&settings.disconnect_time_str)?,
            max_reconnect_attempts: settings.max_reconnect_attempts,
            reconnect_delay_secs: settings.reconnect_delay,
        })
    }
}

/// Source and sink of the tunnel configuration
pub trait SettingsProvider: Send + Sync {
    /// Load the stored configuration, or the defaults when nothing is stored
    fn load(&self) -> Result<TunnelConfig>;

    /// Persist the configuration
    fn save(&self, config: &TunnelConfig) -> Result<()>;
}

/// Settings stored as a JSON document on disk
#[derive(Debug, Clone)]
pub struct JsonSettingsFile {
    path: PathBuf,
}

impl JsonSettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Settings file used when none is configured: `~/.ssh_tunnel_manager.json`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
        Ok(home.join(".ssh_tunnel_manager.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw record without converting it
    pub fn load_record(&self) -> Result<PersistedSettings> {
        if !self.path.exists() {
            debug!("Settings file does not exist: {}", self.path.display());
            return Ok(PersistedSettings::default());
        }

        let contents = fs::read_to_string(&self.path)?;
        let record: PersistedSettings = serde_json::from_str(&contents)?;
        Ok(record)
    }
}

impl SettingsProvider for JsonSettingsFile {
    fn load(&self) -> Result<TunnelConfig> {
        let config = TunnelConfig::try_from(self.load_record()?)?;
        info!("Settings loaded from {}", self.path.display());
        Ok(config)
    }

    fn save(&self, config: &TunnelConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let record = PersistedSettings::from(config);
        let contents = serde_json::to_string_pretty(&record)?;
        fs::write(&self.path, contents)?;

        info!("Settings saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn sample_config() -> TunnelConfig {
        TunnelConfig {
            host: "relay.example.net".to_string(),
            ssh_port: 2200,
            username: "media".to_string(),
            private_key_path: PathBuf::from("/home/media/.ssh/id_rsa"),
            local_port: 8096,
            remote_port: 18096,
            auto_reconnect: false,
            scheduled_connect: true,
            connect_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            disconnect_time: NaiveTime::from_hms_opt(7, 45, 0).unwrap(),
            max_reconnect_attempts: 8,
            reconnect_delay_secs: 3,
        }
    }

    #[test]
    fn test_save_then_load_reproduces_config() {
        let dir = tempfile::tempdir().unwrap();
        let settings = JsonSettingsFile::new(dir.path().join("nested").join("settings.json"));

        let config = sample_config();
        settings.save(&config).unwrap();
        let loaded = settings.load().unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = JsonSettingsFile::new(dir.path().join("absent.json"));

        assert_eq!(settings.load().unwrap(), TunnelConfig::default());
    }

    #[test]
    fn test_persisted_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let settings = JsonSettingsFile::new(dir.path().join("settings.json"));
        settings.save(&sample_config()).unwrap();

        let raw = fs::read_to_string(settings.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["host"], "relay.example.net");
        assert_eq!(value["port"], 2200);
        assert_eq!(value["key_path"], "/home/media/.ssh/id_rsa");
        assert_eq!(value["connect_time_str"], "22:00");
        assert_eq!(value["disconnect_time_str"], "07:45");
        assert!(value.get("connect_time").is_none());
    }

    #[test]
    fn test_partial_file_uses_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "host": "h", "username": "u", "key_path": "/k", "extra": 1 }"#,
        )
        .unwrap();

        let config = JsonSettingsFile::new(&path).load().unwrap();
        assert_eq!(config.host, "h");
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.local_port, 8096);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.connect_time, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_time_string_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "connect_time_str": "8 o'clock" }"#).unwrap();

        let result = JsonSettingsFile::new(&path).load();
        assert!(matches!(result, Err(Error::InvalidTime(_))));
    }
}

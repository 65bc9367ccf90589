// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// Tunnel configuration for SSH Reverse Tunnel

use std::path::PathBuf;

use chrono::NaiveTime;

use crate::error::{Error, Result};

/// Format used for persisted and user-entered times of day
pub const TIME_FORMAT: &str = "%H:%M";

/// Options passed to every SSH client invocation, in order
const SSH_OPTIONS: [&str; 5] = [
    "ServerAliveInterval=30",
    "ServerAliveCountMax=3",
    "BatchMode=yes",
    "PasswordAuthentication=no",
    "StrictHostKeyChecking=accept-new",
];

/// Complete configuration of the supervised reverse tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// SSH server hostname or IP
    pub host: String,
    /// SSH server port (default: 22)
    pub ssh_port: u16,
    /// SSH username
    pub username: String,
    /// Path to the SSH private key
    pub private_key_path: PathBuf,
    /// Local port the remote side is forwarded to
    pub local_port: u16,
    /// Port bound on the SSH server
    pub remote_port: u16,
    /// Reconnect automatically after failures
    pub auto_reconnect: bool,
    /// Keep the tunnel up only inside the daily window
    pub scheduled_connect: bool,
    pub connect_time: NaiveTime,
    pub disconnect_time: NaiveTime,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt, doubled on each further attempt
    pub reconnect_delay_secs: u64,
}

// Default value functions
pub(crate) fn default_ssh_port() -> u16 {
    22
}

pub(crate) fn default_forward_port() -> u16 {
    8096
}

pub(crate) fn default_connect_time() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default()
}

pub(crate) fn default_disconnect_time() -> NaiveTime {
    NaiveTime::from_hms_opt(22, 0, 0).unwrap_or_default()
}

pub(crate) fn default_max_reconnect_attempts() -> u32 {
    5
}

pub(crate) fn default_reconnect_delay() -> u64 {
    5
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            ssh_port: default_ssh_port(),
            username: String::new(),
            private_key_path: PathBuf::new(),
            local_port: default_forward_port(),
            remote_port: default_forward_port(),
            auto_reconnect: true,
            scheduled_connect: false,
            connect_time: default_connect_time(),
            disconnect_time: default_disconnect_time(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl TunnelConfig {
    /// Validate the settings required before a connection attempt
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty()
            || self.username.trim().is_empty()
            || self.private_key_path.as_os_str().is_empty()
        {
            return Err(Error::Config(
                "Missing required connection settings".to_string(),
            ));
        }
        if self.ssh_port == 0 || self.local_port == 0 || self.remote_port == 0 {
            return Err(Error::Config(
                "Ports must be between 1 and 65535".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate the settings that are checked when a configuration is applied
    pub fn validate_schedule(&self) -> Result<()> {
        if self.scheduled_connect && self.connect_time == self.disconnect_time {
            return Err(Error::Config(format!(
                "Connect and disconnect times are both {}; the schedule window would be empty",
                self.connect_time.format(TIME_FORMAT)
            )));
        }
        if self.reconnect_delay_secs == 0 {
            return Err(Error::Config(
                "Reconnect delay must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }

    /// Arguments for the SSH client, excluding the program name
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.private_key_path.to_string_lossy().into_owned(),
            "-R".to_string(),
            format!("{}:localhost:{}", self.remote_port, self.local_port),
            "-p".to_string(),
            self.ssh_port.to_string(),
            "-N".to_string(),
        ];
        for option in SSH_OPTIONS {
            args.push("-o".to_string());
            args.push(option.to_string());
        }
        args.push(self.destination());
        args
    }

    /// Environment overrides that keep SSH from prompting for a password
    pub fn ssh_env() -> Vec<(String, String)> {
        vec![
            ("SSH_ASKPASS".to_string(), String::new()),
            ("DISPLAY".to_string(), String::new()),
        ]
    }

    /// `user@host` destination
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Parse an `HH:MM` time of day
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), TIME_FORMAT)
        .map_err(|_| Error::InvalidTime(value.to_string()))
}

/// Render a time of day as `HH:MM`
pub fn format_time_of_day(time: &NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> TunnelConfig {
        TunnelConfig {
            host: "gateway.example.com".to_string(),
            username: "tunnel".to_string(),
            private_key_path: PathBuf::from("/home/tunnel/.ssh/id_ed25519"),
            ..TunnelConfig::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_config_empty_key_path() {
        let config = TunnelConfig {
            private_key_path: PathBuf::new(),
            ..valid_config()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_config_empty_host_or_user() {
        let no_host = TunnelConfig {
            host: "  ".to_string(),
            ..valid_config()
        };
        assert!(no_host.validate().is_err());

        let no_user = TunnelConfig {
            username: String::new(),
            ..valid_config()
        };
        assert!(no_user.validate().is_err());
    }

    #[test]
    fn test_invalid_config_zero_port() {
        let config = TunnelConfig {
            remote_port: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ssh_args_contract() {
        let config = TunnelConfig {
            ssh_port: 2222,
            local_port: 8096,
            remote_port: 9000,
            ..valid_config()
        };

        assert_eq!(
            config.ssh_args(),
            vec![
                "-i",
                "/home/tunnel/.ssh/id_ed25519",
                "-R",
                "9000:localhost:8096",
                "-p",
                "2222",
                "-N",
                "-o",
                "ServerAliveInterval=30",
                "-o",
                "ServerAliveCountMax=3",
                "-o",
                "BatchMode=yes",
                "-o",
                "PasswordAuthentication=no",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "tunnel@gateway.example.com",
            ]
        );
    }

    #[test]
    fn test_ssh_env_suppresses_prompts() {
        let env = TunnelConfig::ssh_env();
        assert!(env.contains(&("SSH_ASKPASS".to_string(), String::new())));
        assert!(env.contains(&("DISPLAY".to_string(), String::new())));
    }

    #[test]
    fn test_degenerate_schedule_rejected() {
        let config = TunnelConfig {
            scheduled_connect: true,
            connect_time: default_connect_time(),
            disconnect_time: default_connect_time(),
            ..valid_config()
        };
        assert!(config.validate_schedule().is_err());

        // Same times are harmless while scheduling is off
        let config = TunnelConfig {
            scheduled_connect: false,
            ..config
        };
        assert!(config.validate_schedule().is_ok());
    }

    #[test]
    fn test_time_of_day_parsing() {
        let time = parse_time_of_day("22:30").unwrap();
        assert_eq!(time, NaiveTime::from_hms_opt(22, 30, 0).unwrap());
        assert_eq!(format_time_of_day(&time), "22:30");

        assert!(matches!(
            parse_time_of_day("25:61"),
            Err(Error::InvalidTime(_))
        ));
        assert!(parse_time_of_day("noon").is_err());
    }
}

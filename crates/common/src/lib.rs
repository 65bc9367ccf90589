// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - Common Library
// Shared types, configuration and settings persistence

pub mod config;
pub mod error;
pub mod settings;
pub mod types;

pub use config::{format_time_of_day, parse_time_of_day, TunnelConfig, TIME_FORMAT};
pub use error::{Error, Result};
pub use settings::{JsonSettingsFile, PersistedSettings, SettingsProvider};
pub use types::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, ControllerEvent, TunnelStatus,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Local, NaiveTime};

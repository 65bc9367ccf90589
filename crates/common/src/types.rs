// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// Common types for SSH Reverse Tunnel

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Connection state of the supervised tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected, // no SSH client running
    Connecting,   // client spawned, still inside the grace window
    Connected,    // client survived the grace window
    Error,        // last attempt failed; behaves like Disconnected
}

impl ConnectionState {
    /// Whether a `start()` request is accepted in this state
    pub fn accepts_start(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }

    /// Check if the state represents a live or pending SSH client
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Error => "Error",
        };
        f.write_str(label)
    }
}

/// Kind of entry recorded in the connection history
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Reconnecting,
}

impl fmt::Display for ConnectionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionEventKind::Connecting => "Connecting",
            ConnectionEventKind::Connected => "Connected",
            ConnectionEventKind::Disconnected => "Disconnected",
            ConnectionEventKind::Error => "Error",
            ConnectionEventKind::Reconnecting => "Reconnecting",
        };
        f.write_str(label)
    }
}

/// Immutable record appended to the connection history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionEvent {
    pub kind: ConnectionEventKind,
    pub timestamp: DateTime<Local>,
    pub details: String,
}

impl ConnectionEvent {
    pub fn new(kind: ConnectionEventKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Local::now(),
            details: details.into(),
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.kind,
            self.details
        )
    }
}

/// Events emitted by the tunnel controller to any front end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    /// Connection state changed
    StatusChanged {
        state: ConnectionState,
        message: String,
    },

    /// A connection event was appended to the history
    Connection(ConnectionEvent),

    /// Traffic indicator refreshed (KB/s)
    BandwidthUpdated { upload_kbs: f64, download_kbs: f64 },
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelStatus {
    pub state: ConnectionState,
    /// Last status message (e.g. "Connected", "Connection lost")
    pub message: String,
    /// Reconnect attempts made since the last successful connection
    pub reconnect_attempt: u32,
    pub max_reconnect_attempts: u32,
    /// Whether a reconnect timer is armed
    pub reconnect_pending: bool,
    /// PID of the live SSH client, if any
    pub pid: Option<u32>,
}

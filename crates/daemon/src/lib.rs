// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - Daemon Library
// Tunnel controller and its parts, driven by the `ssh-revtunnel` binary

pub mod bandwidth;
pub mod config;
pub mod controller;
pub mod logging;
pub mod pidfile;
pub mod reconnect;
pub mod schedule;
pub mod supervisor;

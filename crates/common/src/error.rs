// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// Error types for SSH Reverse Tunnel

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid time of day '{0}' (expected HH:MM)")]
    InvalidTime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

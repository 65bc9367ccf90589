// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - PID File Management
// Ensures only one supervisor instance runs per user

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// PID file guard - automatically removes PID file on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Claim the PID file at `path`
    ///
    /// Fails if the recorded process is still alive. A stale or unreadable
    /// file is replaced.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(contents) => match contents.trim().parse::<u32>() {
                    Ok(pid) if is_process_running(pid) => {
                        anyhow::bail!(
                            "Supervisor is already running with PID {}. \
                             Stop it first or remove {} if it's stale.",
                            pid,
                            path.display()
                        );
                    }
                    Ok(pid) => {
                        warn!(
                            "Found stale PID file for process {} (not running), removing it",
                            pid
                        );
                        fs::remove_file(path).context("Failed to remove stale PID file")?;
                    }
                    Err(_) => {
                        warn!("PID file {} is corrupt, replacing it", path.display());
                        fs::remove_file(path).context("Failed to remove corrupt PID file")?;
                    }
                },
                Err(e) => {
                    warn!("Failed to read PID file {}: {}", path.display(), e);
                    let _ = fs::remove_file(path);
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }

        let pid = std::process::id();
        fs::write(path, pid.to_string()).context("Failed to write PID file")?;

        info!("Created PID file at {} with PID {}", path.display(), pid);

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };

    // Signal 0 only checks that the process exists
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }

    // EPERM: it exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    warn!("Process existence check not implemented for this platform");
    true
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => debug!("Removed PID file: {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_prevents_multiple_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("daemon.pid");

        let guard = PidFileGuard::create(&path).expect("first instance should succeed");
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );

        let result = PidFileGuard::create(&path);
        assert!(result.unwrap_err().to_string().contains("already running"));

        drop(guard);
        assert!(!path.exists());
        let _guard = PidFileGuard::create(&path).expect("should succeed after drop");
    }

    #[test]
    fn test_stale_and_corrupt_files_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        // Above any kernel pid_max
        fs::write(&path, i32::MAX.to_string()).unwrap();
        drop(PidFileGuard::create(&path).unwrap());

        fs::write(&path, "not a pid").unwrap();
        let _guard = PidFileGuard::create(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(i32::MAX as u32));
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - Process Supervisor
// Owns the single SSH client process and reports its exit to the controller

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a terminated client may take to exit before it is killed
pub const TERMINATION_WAIT: Duration = Duration::from_millis(500);

/// Upper bound on draining output pipes after the client exited
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("an SSH client is already running (pid {0:?})")]
    AlreadyRunning(Option<u32>),

    #[error("{0}")]
    Spawn(#[from] std::io::Error),
}

/// Program, arguments and environment overrides for one client launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Command line as it would be typed in a shell (for logs)
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Exit record of one client process
#[derive(Debug, Clone)]
pub struct ProcessExit {
    /// Launch this exit belongs to
    pub generation: u64,
    /// Exit code, `None` when the process was ended by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Whether the exit was requested through `stop()`
    pub terminated: bool,
}

impl ProcessExit {
    /// Best diagnostic text the client left behind
    pub fn diagnostics(&self) -> String {
        [self.stderr.trim(), self.stdout.trim()]
            .into_iter()
            .find(|text| !text.is_empty())
            .unwrap_or("no output")
            .to_string()
    }

    pub fn code_label(&self) -> String {
        match self.code {
            Some(code) => code.to_string(),
            None => "none (terminated by signal)".to_string(),
        }
    }
}

/// Handle to the live client process
struct LiveProcess {
    generation: u64,
    pid: Option<u32>,
    terminate_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<ProcessExit>,
}

/// Launches the SSH client and watches it on a dedicated task
///
/// Holds at most one live process. Exits observed by the monitor task are sent
/// over `exit_tx`; they carry the launch generation so the owner can discard
/// notifications for processes it has already stopped.
pub struct ProcessSupervisor {
    exit_tx: mpsc::Sender<ProcessExit>,
    termination_wait: Duration,
    live: Option<LiveProcess>,
    next_generation: u64,
}

impl ProcessSupervisor {
    pub fn new(exit_tx: mpsc::Sender<ProcessExit>, termination_wait: Duration) -> Self {
        Self {
            exit_tx,
            termination_wait,
            live: None,
            next_generation: 1,
        }
    }

    /// Spawn the client. Returns the generation of the new launch.
    pub fn spawn(&mut self, spec: &CommandSpec) -> Result<u64, SupervisorError> {
        if let Some(live) = &self.live {
            return Err(SupervisorError::AlreadyRunning(live.pid));
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;
        let pid = child.id();
        let generation = self.next_generation;
        self.next_generation += 1;

        info!("SSH client started (pid {:?}, attempt #{})", pid, generation);

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_process(
            child,
            generation,
            terminate_rx,
            self.termination_wait,
            self.exit_tx.clone(),
        ));

        self.live = Some(LiveProcess {
            generation,
            pid,
            terminate_tx: Some(terminate_tx),
            monitor,
        });

        Ok(generation)
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.live.as_ref().and_then(|live| live.pid)
    }

    /// Whether `generation` is the launch currently held
    pub fn is_current(&self, generation: u64) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
    }

    /// Drop the handle after its exit was observed. Returns false for stale generations.
    pub fn release(&mut self, generation: u64) -> bool {
        if self.is_current(generation) {
            self.live = None;
            true
        } else {
            false
        }
    }

    /// Terminate the live client, escalating to a kill after the termination wait
    pub async fn stop(&mut self) -> Option<ProcessExit> {
        let mut live = self.live.take()?;

        debug!("Stopping SSH client (pid {:?})", live.pid);
        if let Some(tx) = live.terminate_tx.take() {
            // The monitor may already be gone if the client just exited
            let _ = tx.send(());
        }

        match live.monitor.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                warn!("SSH client monitor task failed: {}", e);
                None
            }
        }
    }
}

/// Wait for the client to exit or for a termination request, then report
async fn monitor_process(
    mut child: Child,
    generation: u64,
    terminate_rx: oneshot::Receiver<()>,
    termination_wait: Duration,
    exit_tx: mpsc::Sender<ProcessExit>,
) -> ProcessExit {
    let stdout = capture(child.stdout.take());
    let stderr = capture(child.stderr.take());

    let (status, terminated) = tokio::select! {
        status = child.wait() => (status, false),
        // A dropped sender means the supervisor itself is gone; stop as well
        _ = terminate_rx => (terminate(&mut child, termination_wait).await, true),
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Failed to wait for SSH client: {}", e);
            None
        }
    };

    let exit = ProcessExit {
        generation,
        code,
        stdout: collect(stdout).await,
        stderr: collect(stderr).await,
        terminated,
    };

    if !terminated && exit_tx.send(exit.clone()).await.is_err() {
        debug!("Controller gone, dropping exit of attempt #{}", generation);
    }

    exit
}

/// Ask the client to exit, kill it if it is still alive after `wait`
async fn terminate(child: &mut Child, wait: Duration) -> std::io::Result<ExitStatus> {
    request_exit(child);

    match tokio::time::timeout(wait, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Tunnel process did not terminate gracefully, forcing kill");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SIGTERM lets ssh tear down the forwarding cleanly
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            debug!("SIGTERM to pid {} failed: {}", pid, std::io::Error::last_os_error());
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to signal SSH client: {}", e);
    }
}

fn capture<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!("Failed to read SSH client output: {}", e);
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(handle: JoinHandle<String>) -> String {
    match tokio::time::timeout(CAPTURE_TIMEOUT, handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("Output capture task failed: {}", e);
            String::new()
        }
        Err(_) => {
            debug!("Output pipe still open after client exit, giving up on it");
            String::new()
        }
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - Tunnel Controller
// Connection state machine. A single actor task owns the state, the history,
// every timer and the process handle; callers talk to it through a handle.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use ssh_revtunnel_common::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, ControllerEvent, SettingsProvider,
    TunnelConfig, TunnelStatus,
};

use crate::bandwidth::{BandwidthMonitor, BandwidthSample, BANDWIDTH_INTERVAL};
use crate::reconnect::{ReconnectDecision, ReconnectScheduler};
use crate::schedule::{ScheduleAction, ScheduleWindow, SCHEDULE_TICK};
use crate::supervisor::{CommandSpec, ProcessExit, ProcessSupervisor, TERMINATION_WAIT};

/// A client still running this long after spawn counts as connected
pub const GRACE_WINDOW: Duration = Duration::from_secs(1);

const COMMAND_CHANNEL_SIZE: usize = 32;
const EVENT_CHANNEL_SIZE: usize = 100;

/// Fixed intervals used by the controller
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub grace_window: Duration,
    pub termination_wait: Duration,
    pub schedule_tick: Duration,
    pub bandwidth_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            grace_window: GRACE_WINDOW,
            termination_wait: TERMINATION_WAIT,
            schedule_tick: SCHEDULE_TICK,
            bandwidth_interval: BANDWIDTH_INTERVAL,
        }
    }
}

/// Ways a tunnel attempt can fail. The message becomes the event details.
#[derive(Error, Debug)]
pub enum TunnelFailure {
    #[error("{0}")]
    ConfigInvalid(String),

    #[error("Failed to start tunnel: {0}")]
    SpawnFailure(String),

    #[error("Tunnel process failed (exit code {code}): {diagnostics}")]
    EarlyExit { code: String, diagnostics: String },

    #[error("Connection lost. Exit code: {0}")]
    UnexpectedTermination(String),

    #[error("Maximum reconnection attempts reached")]
    ReconnectExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOrigin {
    Manual,
    Schedule,
    Reconnect,
}

enum Command {
    Start {
        reply: oneshot::Sender<ConnectionState>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Toggle {
        reply: oneshot::Sender<ConnectionState>,
    },
    Status {
        reply: oneshot::Sender<TunnelStatus>,
    },
    History {
        reply: oneshot::Sender<Vec<ConnectionEvent>>,
    },
    ClearHistory {
        reply: oneshot::Sender<()>,
    },
    Config {
        reply: oneshot::Sender<TunnelConfig>,
    },
    ApplyConfig {
        config: TunnelConfig,
        reply: oneshot::Sender<ssh_revtunnel_common::Result<()>>,
    },
    SaveSettings {
        reply: oneshot::Sender<ssh_revtunnel_common::Result<()>>,
    },
    ReloadSettings {
        reply: oneshot::Sender<ssh_revtunnel_common::Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the tunnel controller
///
/// Cheap to clone. Dropping the last handle stops the tunnel and ends the
/// controller task.
#[derive(Clone)]
pub struct TunnelController {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ControllerEvent>,
}

impl TunnelController {
    /// Spawn the controller task on the current runtime
    pub fn spawn(
        config: TunnelConfig,
        settings: Arc<dyn SettingsProvider>,
        ssh_program: impl Into<String>,
    ) -> Self {
        Self::spawn_with_timings(config, settings, ssh_program, Timings::default())
    }

    pub fn spawn_with_timings(
        config: TunnelConfig,
        settings: Arc<dyn SettingsProvider>,
        ssh_program: impl Into<String>,
        timings: Timings,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let actor = TunnelActor::new(
            config,
            settings,
            ssh_program.into(),
            timings,
            event_tx.clone(),
        );
        tokio::spawn(actor.run(command_rx));

        Self {
            commands: command_tx,
            events: event_tx,
        }
    }

    /// Subscribe to status, connection and bandwidth events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Start the tunnel. Returns the state after the request was handled.
    pub async fn start(&self) -> Result<ConnectionState> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stop the tunnel and cancel any pending reconnect
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Stop a connecting or connected tunnel, start an idle one.
    /// Returns the state after the request was handled.
    pub async fn toggle(&self) -> Result<ConnectionState> {
        self.request(|reply| Command::Toggle { reply }).await
    }

    pub async fn status(&self) -> Result<TunnelStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn history(&self) -> Result<Vec<ConnectionEvent>> {
        self.request(|reply| Command::History { reply }).await
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.request(|reply| Command::ClearHistory { reply }).await
    }

    pub async fn config(&self) -> Result<TunnelConfig> {
        self.request(|reply| Command::Config { reply }).await
    }

    /// Replace the live configuration. A running tunnel is not restarted.
    pub async fn apply_config(&self, config: TunnelConfig) -> Result<()> {
        self.request(|reply| Command::ApplyConfig { config, reply })
            .await?
            .context("Invalid tunnel configuration")
    }

    /// Persist the live configuration through the settings provider
    pub async fn save_settings(&self) -> Result<()> {
        self.request(|reply| Command::SaveSettings { reply })
            .await?
            .context("Failed to save settings")
    }

    /// Re-read the settings provider and apply the result like `apply_config`
    pub async fn reload_settings(&self) -> Result<()> {
        self.request(|reply| Command::ReloadSettings { reply })
            .await?
            .context("Failed to reload settings")
    }

    /// Stop the tunnel and end the controller task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| anyhow!("Tunnel controller is not running"))?;
        reply_rx
            .await
            .context("Tunnel controller stopped before replying")
    }
}

/// Grace deadline of the launch currently in Connecting
#[derive(Debug, Default)]
struct GraceTimer {
    armed: Option<(u64, Instant)>,
}

impl GraceTimer {
    fn arm(&mut self, generation: u64, after: Duration) {
        self.armed = Some((generation, Instant::now() + after));
    }

    fn cancel(&mut self) {
        self.armed = None;
    }

    async fn elapsed(&mut self) -> u64 {
        match self.armed {
            Some((generation, deadline)) => {
                sleep_until(deadline).await;
                self.armed = None;
                generation
            }
            None => future::pending().await,
        }
    }
}

enum Wake {
    Command(Command),
    ProcessExited(ProcessExit),
    GraceElapsed(u64),
    ReconnectDue(u32),
    ScheduleTick,
    Bandwidth(BandwidthSample),
}

struct TunnelActor {
    config: TunnelConfig,
    settings: Arc<dyn SettingsProvider>,
    ssh_program: String,
    state: ConnectionState,
    message: String,
    history: Vec<ConnectionEvent>,
    supervisor: ProcessSupervisor,
    exits: mpsc::Receiver<ProcessExit>,
    grace_window: Duration,
    grace: GraceTimer,
    reconnect: ReconnectScheduler,
    bandwidth: BandwidthMonitor,
    schedule_tick: Interval,
    events: broadcast::Sender<ControllerEvent>,
}

impl TunnelActor {
    fn new(
        config: TunnelConfig,
        settings: Arc<dyn SettingsProvider>,
        ssh_program: String,
        timings: Timings,
        events: broadcast::Sender<ControllerEvent>,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::channel(8);

        // First evaluation one tick after startup
        let mut schedule_tick = interval_at(
            Instant::now() + timings.schedule_tick,
            timings.schedule_tick,
        );
        schedule_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if let Some(window) = ScheduleWindow::from_config(&config) {
            if config.validate_schedule().is_err() {
                warn!(
                    "Schedule window {} is empty; scheduled connect will never act",
                    window.describe()
                );
            } else {
                info!("Scheduled connection window: {}", window.describe());
            }
        }

        Self {
            reconnect: ReconnectScheduler::new(
                config.max_reconnect_attempts,
                config.reconnect_delay_secs,
            ),
            config,
            settings,
            ssh_program,
            state: ConnectionState::Disconnected,
            message: "Disconnected".to_string(),
            history: Vec::new(),
            supervisor: ProcessSupervisor::new(exit_tx, timings.termination_wait),
            exits: exit_rx,
            grace_window: timings.grace_window,
            grace: GraceTimer::default(),
            bandwidth: BandwidthMonitor::new(timings.bandwidth_interval),
            schedule_tick,
            events,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Tunnel controller started");
        let mut shutdown_reply = None;

        loop {
            let wake = tokio::select! {
                biased;

                Some(exit) = self.exits.recv() => Wake::ProcessExited(exit),

                command = commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => break,
                },

                generation = self.grace.elapsed() => Wake::GraceElapsed(generation),

                attempt = self.reconnect.fired() => Wake::ReconnectDue(attempt),

                _ = self.schedule_tick.tick() => Wake::ScheduleTick,

                sample = self.bandwidth.tick() => Wake::Bandwidth(sample),
            };

            match wake {
                Wake::Command(command) => {
                    if let Some(reply) = self.handle_command(command).await {
                        shutdown_reply = Some(reply);
                        break;
                    }
                }
                Wake::ProcessExited(exit) => self.on_process_exit(exit),
                Wake::GraceElapsed(generation) => self.on_grace_elapsed(generation),
                Wake::ReconnectDue(attempt) => {
                    info!(
                        "Attempting reconnection ({}/{})",
                        attempt,
                        self.reconnect.policy().max_attempts
                    );
                    self.start(StartOrigin::Reconnect);
                }
                Wake::ScheduleTick => self.on_schedule_tick().await,
                Wake::Bandwidth(sample) => self.publish_bandwidth(sample),
            }
        }

        // Handles are gone or shutdown was requested: leave nothing running
        self.stop().await;
        info!("Tunnel controller stopped");

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Handle one request. Returns the reply channel when shutdown was requested.
    async fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Start { reply } => {
                let state = self.start(StartOrigin::Manual);
                let _ = reply.send(state);
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::Toggle { reply } => {
                if self.state.is_active() {
                    self.stop().await;
                } else {
                    self.start(StartOrigin::Manual);
                }
                let _ = reply.send(self.state);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::History { reply } => {
                let _ = reply.send(self.history.clone());
            }
            Command::ClearHistory { reply } => {
                self.history.clear();
                info!("Connection history cleared");
                let _ = reply.send(());
            }
            Command::Config { reply } => {
                let _ = reply.send(self.config.clone());
            }
            Command::ApplyConfig { config, reply } => {
                let _ = reply.send(self.apply_config(config));
            }
            Command::SaveSettings { reply } => {
                let _ = reply.send(self.settings.save(&self.config));
            }
            Command::ReloadSettings { reply } => {
                let result = self
                    .settings
                    .load()
                    .and_then(|config| self.apply_config(config));
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => return Some(reply),
        }

        None
    }

    fn start(&mut self, origin: StartOrigin) -> ConnectionState {
        if !self.state.accepts_start() {
            info!("Tunnel is already connected or connecting");
            return self.state;
        }

        if origin != StartOrigin::Reconnect {
            if self.reconnect.cancel() {
                debug!("Pending reconnect superseded by {:?} start", origin);
            }
            self.reconnect.reset();
        }

        if let Err(e) = self.config.validate() {
            let reason = match e {
                ssh_revtunnel_common::Error::Config(reason) => reason,
                other => other.to_string(),
            };
            self.fail(TunnelFailure::ConfigInvalid(reason));
            return self.state;
        }

        self.set_state(ConnectionState::Connecting, "Connecting...");
        self.record(ConnectionEventKind::Connecting, "Attempting to establish tunnel");

        let spec = self.command_spec();
        info!("Starting SSH tunnel with command: {}", spec.display());

        match self.supervisor.spawn(&spec) {
            Ok(generation) => self.grace.arm(generation, self.grace_window),
            Err(e) => self.fail(TunnelFailure::SpawnFailure(e.to_string())),
        }

        self.state
    }

    async fn stop(&mut self) {
        let reconnect_cancelled = self.reconnect.cancel();

        if self.state == ConnectionState::Disconnected && !self.supervisor.is_live() {
            if reconnect_cancelled {
                info!("Pending reconnect cancelled");
            }
            return;
        }

        info!("Stopping SSH tunnel");
        self.grace.cancel();

        if let Some(exit) = self.supervisor.stop().await {
            debug!(
                "SSH client exited with code {} (terminated: {})",
                exit.code_label(),
                exit.terminated
            );
        }

        self.set_state(ConnectionState::Disconnected, "Disconnected");
        self.record(ConnectionEventKind::Disconnected, "Tunnel stopped manually");

        let idle = self.bandwidth.stop();
        self.publish_bandwidth(idle);
    }

    fn on_grace_elapsed(&mut self, generation: u64) {
        if self.state != ConnectionState::Connecting || !self.supervisor.is_current(generation) {
            debug!("Ignoring grace deadline of superseded attempt #{}", generation);
            return;
        }

        info!("Tunnel established successfully");
        self.set_state(ConnectionState::Connected, "Connected");
        self.record(ConnectionEventKind::Connected, "Tunnel established successfully");

        self.reconnect.reset();
        self.reconnect.cancel();
        self.bandwidth.start();
    }

    fn on_process_exit(&mut self, exit: ProcessExit) {
        if !self.supervisor.release(exit.generation) {
            debug!(
                "Ignoring exit of superseded attempt #{} (code {})",
                exit.generation,
                exit.code_label()
            );
            return;
        }

        if !exit.stdout.trim().is_empty() {
            debug!("SSH client stdout: {}", exit.stdout.trim());
        }

        match self.state {
            ConnectionState::Connecting => {
                self.grace.cancel();
                self.fail(TunnelFailure::EarlyExit {
                    code: exit.code_label(),
                    diagnostics: exit.diagnostics(),
                });

                if self.config.auto_reconnect {
                    self.schedule_reconnect();
                }
            }
            ConnectionState::Connected => {
                let failure = TunnelFailure::UnexpectedTermination(exit.code_label());
                warn!("Tunnel connection lost. Exit code: {}", exit.code_label());
                if !exit.stderr.trim().is_empty() {
                    debug!("SSH client stderr: {}", exit.stderr.trim());
                }

                self.set_state(ConnectionState::Disconnected, "Connection lost");
                self.record(ConnectionEventKind::Disconnected, failure.to_string());

                let idle = self.bandwidth.stop();
                self.publish_bandwidth(idle);

                if self.config.auto_reconnect {
                    self.schedule_reconnect();
                }
            }
            other => {
                debug!("SSH client exited while {}", other);
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.schedule() {
            ReconnectDecision::Scheduled { attempt, delay } => {
                info!(
                    "Scheduling reconnection attempt {} in {} seconds",
                    attempt,
                    delay.as_secs()
                );
                self.record(
                    ConnectionEventKind::Reconnecting,
                    format!(
                        "Attempt {} scheduled in {} seconds",
                        attempt,
                        delay.as_secs()
                    ),
                );
            }
            ReconnectDecision::Exhausted { max_attempts } => {
                error!("Maximum reconnection attempts ({}) reached", max_attempts);
                self.record(
                    ConnectionEventKind::Error,
                    TunnelFailure::ReconnectExhausted.to_string(),
                );
            }
        }
    }

    async fn on_schedule_tick(&mut self) {
        let Some(window) = ScheduleWindow::from_config(&self.config) else {
            return;
        };

        match window.evaluate(Local::now().time(), self.state) {
            Some(ScheduleAction::Start) => {
                info!("Scheduled connection: time to connect ({})", window.describe());
                self.start(StartOrigin::Schedule);
            }
            Some(ScheduleAction::Stop) => {
                info!("Scheduled connection: time to disconnect ({})", window.describe());
                self.stop().await;
            }
            None => {}
        }
    }

    fn apply_config(&mut self, config: TunnelConfig) -> ssh_revtunnel_common::Result<()> {
        config.validate_schedule()?;

        self.reconnect
            .set_limits(config.max_reconnect_attempts, config.reconnect_delay_secs);
        if !config.auto_reconnect && self.reconnect.cancel() {
            info!("Auto-reconnect disabled, pending reconnect cancelled");
        }

        self.config = config;
        info!("Tunnel configuration applied");
        Ok(())
    }

    fn command_spec(&self) -> CommandSpec {
        CommandSpec {
            program: self.ssh_program.clone(),
            args: self.config.ssh_args(),
            env: TunnelConfig::ssh_env(),
        }
    }

    fn status(&self) -> TunnelStatus {
        TunnelStatus {
            state: self.state,
            message: self.message.clone(),
            reconnect_attempt: self.reconnect.policy().current_attempt(),
            max_reconnect_attempts: self.reconnect.policy().max_attempts,
            reconnect_pending: self.reconnect.is_armed(),
            pid: self.supervisor.pid(),
        }
    }

    fn fail(&mut self, failure: TunnelFailure) {
        let message = failure.to_string();
        error!("{}", message);
        self.set_state(ConnectionState::Error, message.clone());
        self.record(ConnectionEventKind::Error, message);
    }

    fn set_state(&mut self, state: ConnectionState, message: impl Into<String>) {
        self.state = state;
        self.message = message.into();
        debug!("Tunnel state: {} ({})", self.state, self.message);
        self.emit(ControllerEvent::StatusChanged {
            state,
            message: self.message.clone(),
        });
    }

    fn record(&mut self, kind: ConnectionEventKind, details: impl Into<String>) {
        let event = ConnectionEvent::new(kind, details);
        info!("Connection event: {}", event);
        self.history.push(event.clone());
        self.emit(ControllerEvent::Connection(event));
    }

    fn publish_bandwidth(&self, sample: BandwidthSample) {
        self.emit(ControllerEvent::BandwidthUpdated {
            upload_kbs: sample.upload_kbs,
            download_kbs: sample.download_kbs,
        });
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

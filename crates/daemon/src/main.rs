// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - Supervisor
// Keeps one SSH reverse tunnel up: reconnects with backoff and follows an
// optional daily connect window

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, trace, warn};

use ssh_revtunnel_common::{
    parse_time_of_day, ControllerEvent, JsonSettingsFile, NaiveTime, PersistedSettings,
    SettingsProvider, TunnelConfig,
};

use ssh_revtunnel_daemon::config::DaemonConfig;
use ssh_revtunnel_daemon::controller::TunnelController;
use ssh_revtunnel_daemon::logging;
use ssh_revtunnel_daemon::pidfile::PidFileGuard;

#[derive(Parser)]
#[command(name = "ssh-revtunnel")]
#[command(about = "Supervise a persistent SSH reverse tunnel", long_about = None)]
#[command(version)]
struct Cli {
    /// Daemon configuration file (default: <config dir>/ssh-revtunnel/daemon.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tunnel settings file (overrides daemon configuration)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log file (overrides daemon configuration)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel supervisor until Ctrl+C or SIGTERM (default).
    /// SIGHUP reloads settings, SIGUSR1 logs status and history,
    /// SIGUSR2 toggles the tunnel.
    Run {
        /// Connect immediately instead of waiting for the schedule
        #[arg(long)]
        connect: bool,
    },

    /// Inspect or edit the tunnel settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the stored settings as JSON
    Show,

    /// Change stored settings
    Set(SetArgs),

    /// Print the settings file path
    Path,
}

#[derive(Args, Default)]
struct SetArgs {
    /// SSH server
    #[arg(long)]
    host: Option<String>,

    /// SSH server port
    #[arg(long)]
    port: Option<u16>,

    /// SSH username
    #[arg(long)]
    username: Option<String>,

    /// Path to SSH private key
    #[arg(long)]
    key_path: Option<PathBuf>,

    /// Local port exposed through the tunnel
    #[arg(long)]
    local_port: Option<u16>,

    /// Port opened on the SSH server
    #[arg(long)]
    remote_port: Option<u16>,

    /// Reconnect after failures
    #[arg(long)]
    auto_reconnect: Option<bool>,

    /// Follow the daily connect window
    #[arg(long)]
    scheduled_connect: Option<bool>,

    /// Daily connect time (HH:MM)
    #[arg(long, value_parser = parse_time_arg)]
    connect_time: Option<NaiveTime>,

    /// Daily disconnect time (HH:MM)
    #[arg(long, value_parser = parse_time_arg)]
    disconnect_time: Option<NaiveTime>,

    /// Maximum reconnect attempts before giving up
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Base reconnect delay in seconds, doubled per attempt
    #[arg(long)]
    reconnect_delay: Option<u64>,
}

impl SetArgs {
    /// Apply the given flags. Returns whether anything was set.
    fn apply(self, config: &mut TunnelConfig) -> bool {
        let mut changed = false;

        if let Some(host) = self.host {
            config.host = host;
            changed = true;
        }
        if let Some(port) = self.port {
            config.ssh_port = port;
            changed = true;
        }
        if let Some(username) = self.username {
            config.username = username;
            changed = true;
        }
        if let Some(key_path) = self.key_path {
            config.private_key_path = key_path;
            changed = true;
        }
        if let Some(port) = self.local_port {
            config.local_port = port;
            changed = true;
        }
        if let Some(port) = self.remote_port {
            config.remote_port = port;
            changed = true;
        }
        if let Some(enabled) = self.auto_reconnect {
            config.auto_reconnect = enabled;
            changed = true;
        }
        if let Some(enabled) = self.scheduled_connect {
            config.scheduled_connect = enabled;
            changed = true;
        }
        if let Some(time) = self.connect_time {
            config.connect_time = time;
            changed = true;
        }
        if let Some(time) = self.disconnect_time {
            config.disconnect_time = time;
            changed = true;
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = attempts;
            changed = true;
        }
        if let Some(delay) = self.reconnect_delay {
            config.reconnect_delay_secs = delay;
            changed = true;
        }

        changed
    }
}

fn parse_time_arg(value: &str) -> std::result::Result<NaiveTime, String> {
    parse_time_of_day(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut daemon_config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(path) = cli.settings {
        daemon_config.settings_path = path;
    }
    if let Some(path) = cli.log_file {
        daemon_config.log_path = path;
    }

    let command = cli.command.unwrap_or(Commands::Run { connect: false });

    // Only the long-running supervisor writes the log file
    let log_file = matches!(command, Commands::Run { .. })
        .then_some(daemon_config.log_path.as_path());
    let _log_guard = logging::init(log_file, cli.verbose)?;

    match command {
        Commands::Run { connect } => run_supervisor(&daemon_config, connect).await,
        Commands::Config { action } => run_config(&daemon_config, action),
    }
}

async fn run_supervisor(daemon_config: &DaemonConfig, connect: bool) -> Result<()> {
    info!("SSH Reverse Tunnel supervisor starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let _pid_guard = PidFileGuard::create(&daemon_config.pid_path)
        .context("Failed to create PID file - another supervisor may already be running")?;

    let settings: Arc<dyn SettingsProvider> =
        Arc::new(JsonSettingsFile::new(&daemon_config.settings_path));
    let tunnel_config = match settings.load() {
        Ok(config) => {
            info!("Tunnel target: {}", config.destination());
            config
        }
        Err(e) => {
            error!("Error loading settings: {}", e);
            TunnelConfig::default()
        }
    };

    let controller = TunnelController::spawn(
        tunnel_config,
        settings,
        daemon_config.ssh_program.clone(),
    );

    // Connection events are logged by the controller itself
    let mut event_rx = controller.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(ControllerEvent::StatusChanged { state, message }) => {
                    info!("Status: {} - {}", state, message);
                }
                Ok(ControllerEvent::BandwidthUpdated {
                    upload_kbs,
                    download_kbs,
                }) => {
                    trace!("Bandwidth: up {:.1} KB/s, down {:.1} KB/s", upload_kbs, download_kbs);
                }
                Ok(ControllerEvent::Connection(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event logger fell behind, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    if connect {
        controller.start().await?;
    }

    info!("Supervisor started successfully");
    control_loop(&controller).await?;

    controller.shutdown().await?;
    info!("Supervisor shut down");
    Ok(())
}

fn run_config(daemon_config: &DaemonConfig, action: ConfigAction) -> Result<()> {
    let settings = JsonSettingsFile::new(&daemon_config.settings_path);

    match action {
        ConfigAction::Show => {
            let config = settings.load().context("Failed to load settings")?;
            let json = serde_json::to_string_pretty(&PersistedSettings::from(&config))
                .context("Failed to serialize settings")?;
            println!("{}", json);
        }
        ConfigAction::Set(args) => {
            let mut config = settings.load().context("Failed to load settings")?;
            if !args.apply(&mut config) {
                anyhow::bail!("Nothing to change; pass at least one setting");
            }
            config
                .validate_schedule()
                .context("Invalid tunnel configuration")?;
            settings.save(&config).context("Failed to save settings")?;
            println!("Settings saved to {}", settings.path().display());
        }
        ConfigAction::Path => {
            println!("{}", settings.path().display());
        }
    }

    Ok(())
}

/// Serve control signals until Ctrl+C or SIGTERM
#[cfg(unix)]
async fn control_loop(controller: &TunnelController) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    let mut sigusr2 =
        signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2 handler")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading settings");
                match controller.reload_settings().await {
                    Ok(()) => info!("Settings reloaded"),
                    Err(e) => error!("Keeping current settings: {:#}", e),
                }
            }
            _ = sigusr1.recv() => log_report(controller).await?,
            _ = sigusr2.recv() => {
                let state = controller.toggle().await?;
                info!("Received SIGUSR2, tunnel now {}", state);
            }
        }
    }

    Ok(())
}

/// Wait for Ctrl+C
#[cfg(not(unix))]
async fn control_loop(_controller: &TunnelController) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down");
    Ok(())
}

/// Log the status snapshot followed by the connection history
#[cfg(unix)]
async fn log_report(controller: &TunnelController) -> Result<()> {
    let status = controller.status().await?;
    info!(
        "Status: {} - {} (reconnect attempt {}/{}, pid {})",
        status.state,
        status.message,
        status.reconnect_attempt,
        status.max_reconnect_attempts,
        status
            .pid
            .map_or_else(|| "none".to_string(), |pid| pid.to_string())
    );

    let history = controller.history().await?;
    info!("Connection history: {} events", history.len());
    for event in history {
        info!("  {}", event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_is_default_command() {
        let cli = Cli::try_parse_from(["ssh-revtunnel", "--verbose"]).unwrap();
        assert!(cli.verbose);
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["ssh-revtunnel", "run", "--connect"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run { connect: true })));
    }

    #[test]
    fn test_config_set_flags() {
        let cli = Cli::try_parse_from([
            "ssh-revtunnel",
            "--settings",
            "/tmp/tunnel.json",
            "config",
            "set",
            "--host",
            "gateway.example.com",
            "--auto-reconnect",
            "false",
            "--connect-time",
            "22:30",
        ])
        .unwrap();
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/tunnel.json")));

        let Some(Commands::Config {
            action: ConfigAction::Set(args),
        }) = cli.command
        else {
            panic!("expected config set");
        };

        let mut config = TunnelConfig::default();
        assert!(args.apply(&mut config));
        assert_eq!(config.host, "gateway.example.com");
        assert!(!config.auto_reconnect);
        assert_eq!(config.connect_time, NaiveTime::from_hms_opt(22, 30, 0).unwrap());
        assert_eq!(config.ssh_port, 22);
    }

    #[test]
    fn test_bad_time_rejected_by_parser() {
        let result = Cli::try_parse_from([
            "ssh-revtunnel",
            "config",
            "set",
            "--disconnect-time",
            "25:00",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_set_changes_nothing() {
        let mut config = TunnelConfig::default();
        assert!(!SetArgs::default().apply(&mut config));
        assert_eq!(config, TunnelConfig::default());
    }
}

//! blescale - read a BLE smart scale and export body composition.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use blescale_service::{AppState, Config, RunMode, Runner, default_config_path, open_transport};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "blescale")]
#[command(version, about = "Read BLE smart scales and export body composition")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Take one reading and exit
    #[arg(long, conflicts_with_all = ["poll", "continuous"])]
    once: bool,

    /// Take readings repeatedly, pausing between them
    #[arg(long, conflicts_with = "continuous")]
    poll: bool,

    /// Keep watching and process every reading
    #[arg(long)]
    continuous: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and probe every exporter
    Check,
}

impl Args {
    fn mode(&self, config: &Config) -> RunMode {
        if self.once {
            RunMode::Once
        } else if self.continuous || (config.runtime.continuous && !self.poll) {
            RunMode::Watch
        } else if self.poll {
            RunMode::Poll
        } else {
            RunMode::Once
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("blescale_service={level}").parse()?)
                .add_directive(format!("blescale_core={level}").parse()?),
        )
        .init();

    let path = args.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load_validated(&path)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    let state = AppState::new(config.clone(), Some(path))?;

    if matches!(args.command, Some(Command::Check)) {
        state.healthcheck().await;
        println!("Configuration OK: {} user(s)", config.users.len());
        return Ok(());
    }

    let mode = args.mode(&config);
    info!(?mode, transport = %config.transport.kind, "Starting blescale");
    let transport = open_transport(&config.transport)
        .await
        .context("Failed to open transport")?;
    let runner = Arc::new(Runner::new(Arc::clone(&state), transport));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(Arc::clone(&state), Arc::clone(&runner)));

    let result = runner.run(mode, &cancel).await;
    cancel.cancel();
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => {
            info!("Cancelled");
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            info!("Ctrl-C received, shutting down");
            cancel.cancel();
        }
    }
}

#[cfg(unix)]
async fn reload_on_hangup(state: Arc<AppState>, runner: Arc<Runner>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Failed to listen for SIGHUP: {}", e);
            return;
        }
    };
    while hangup.recv().await.is_some() {
        info!("SIGHUP received, reloading configuration");
        match state.reload().await {
            Ok(()) => runner.publish_remote_config().await,
            Err(e) => error!("Reload failed, keeping previous configuration: {}", e),
        }
    }
}

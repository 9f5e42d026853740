//! tetherd: per-session PTY broker.
//!
//! Spawns one process inside a pseudo-terminal and serves it on a Unix
//! socket until the process exits or the broker is told to stop.

use std::path::PathBuf;

use clap::Parser;
use tether_server::{BrokerConfig, CliOverrides, SessionServer};
use tracing::{error, info};

/// Per-session PTY broker
#[derive(Parser, Debug)]
#[command(name = "tetherd", version, about = "Per-session PTY broker")]
struct Cli {
    /// Session identifier
    #[arg(long)]
    session_id: String,

    /// Scope key the session lives under
    #[arg(long)]
    scope: String,

    /// Exact socket path (overrides --socket-dir)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Directory for the socket file
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Registry directory; the broker removes its entry on shutdown
    #[arg(long)]
    registry_dir: Option<PathBuf>,

    /// Working directory for the process
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Initial terminal rows
    #[arg(long)]
    rows: Option<u16>,

    /// Initial terminal columns
    #[arg(long)]
    cols: Option<u16>,

    /// Extra environment for the process (KEY=VALUE, repeatable)
    #[arg(long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Replay buffer capacity in bytes
    #[arg(long)]
    replay_capacity: Option<usize>,

    /// Config file path
    #[arg(long, default_value = "~/.tether/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command to run (defaults to $SHELL)
    #[arg(last = true)]
    command: Vec<String>,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        session_id = %cli.session_id,
        "starting tetherd"
    );

    let config_path = tether_core::naming::expand_tilde(&cli.config);
    let overrides = CliOverrides {
        session_id: cli.session_id,
        scope_key: cli.scope,
        socket: cli.socket,
        socket_dir: cli.socket_dir,
        registry_dir: cli.registry_dir,
        cwd: cli.cwd,
        rows: cli.rows,
        cols: cli.cols,
        env: cli.env,
        replay_capacity: cli.replay_capacity,
        command: cli.command,
    };
    let config = match BrokerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let shutdown = shutdown_signal();
    match SessionServer::new(config).run(shutdown).await {
        Ok(code) => info!(?code, "tetherd stopped"),
        Err(e) => {
            error!(error = %e, "broker error");
            std::process::exit(1);
        }
    }
}

/// Resolves on SIGTERM, SIGINT or SIGHUP. Handlers are installed before
/// the broker binds, so a launcher's SIGTERM always takes the shutdown path.
fn shutdown_signal() -> impl std::future::Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let handlers = (signal(SignalKind::terminate()), signal(SignalKind::hangup()));
    async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let (mut term, mut hup) = match handlers {
            (Ok(term), Ok(hup)) => (term, hup),
            _ => {
                error!("failed to install SIGTERM/SIGHUP handlers");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
            _ = hup.recv() => {}
        }
    }
}

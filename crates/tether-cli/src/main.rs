//! tether: create, attach to and manage persistent terminal sessions.

mod commands;
mod config;
mod terminal;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tether_core::naming;

#[derive(Parser)]
#[command(
    name = "tether",
    version,
    about = "Persistent terminal sessions behind a local broker"
)]
struct Cli {
    /// Config file path [default: ~/.tether/config.toml]
    #[arg(long, global = true)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Which scope a session lives in. Defaults to the current directory.
#[derive(Args, Clone, Debug)]
pub struct ScopeArgs {
    /// Scope key, as printed by `tether list`
    #[arg(long, conflicts_with = "workspace")]
    pub scope: Option<String>,

    /// Derive the scope from this workspace directory
    #[arg(long, short = 'w')]
    pub workspace: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
pub struct SessionArgs {
    /// Session id
    #[arg(short, long)]
    pub session: String,

    #[command(flatten)]
    pub scope: ScopeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session and print its id
    Create {
        /// Session id (generated if omitted)
        #[arg(short, long)]
        session: Option<String>,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Working directory for the process
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment (KEY=VALUE, repeatable)
        #[arg(long = "env", value_parser = commands::parse_env)]
        env: Vec<(String, String)>,

        /// Attach as controller once created
        #[arg(short, long)]
        attach: bool,

        /// Program and arguments (defaults to $SHELL)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Attach to a running session
    Attach {
        #[command(flatten)]
        target: SessionArgs,

        /// Watch without taking control
        #[arg(long)]
        viewer: bool,

        /// Detach key chord, e.g. ctrl-] or ctrl-a
        #[arg(long)]
        detach_key: Option<String>,
    },

    /// List known sessions and whether their brokers answer
    #[command(alias = "ls")]
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send a signal to a session's process
    Signal {
        #[command(flatten)]
        target: SessionArgs,

        /// interrupt, terminate, kill or hangup
        kind: String,
    },

    /// Resize a session's terminal
    Resize {
        #[command(flatten)]
        target: SessionArgs,

        rows: u16,
        cols: u16,
    },

    /// Terminate a session and remove it from the registry
    #[command(alias = "kill")]
    Destroy {
        #[command(flatten)]
        target: SessionArgs,
    },

    /// Purge sockets and registry entries of dead brokers
    Reap {
        /// Keep sweeping on the configured interval
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so they never mix with session output.
    let subscriber = tracing_subscriber::fmt().with_writer(std::io::stderr);
    if cli.verbose {
        subscriber
            .with_env_filter("tether=debug,tether_client=debug,tether_core=debug")
            .with_target(true)
            .init();
    } else {
        subscriber
            .with_env_filter("tether=warn,tether_client=warn")
            .with_target(false)
            .init();
    }

    let config_path = cli
        .config
        .as_deref()
        .map(naming::expand_tilde)
        .unwrap_or_else(naming::default_config_path);
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("tether: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Create {
            session,
            scope,
            cwd,
            env,
            attach,
            command,
        } => commands::create::run(&cfg, session, &scope, cwd, env, command, attach).await,
        Command::Attach {
            target,
            viewer,
            detach_key,
        } => commands::attach::run(&cfg, &target, viewer, detach_key.as_deref()).await,
        Command::List { json } => commands::list::run(&cfg, json).await,
        Command::Signal { target, kind } => commands::control::signal(&cfg, &target, &kind).await,
        Command::Resize { target, rows, cols } => {
            commands::control::resize(&cfg, &target, rows, cols).await
        }
        Command::Destroy { target } => commands::control::destroy(&cfg, &target).await,
        Command::Reap { watch } => commands::reap::run(&cfg, watch).await,
    };

    if let Err(e) = result {
        eprintln!("tether: {e:#}");
        std::process::exit(1);
    }
}

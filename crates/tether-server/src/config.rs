//! Broker configuration: TOML file + CLI overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tether_core::naming::{self, expand_tilde, validate_id};
use tether_core::{TetherError, TetherResult};
use tracing::info;

use crate::session::pty::ProcessSpec;
use crate::session::ring_buffer::DEFAULT_REPLAY_CAPACITY;

/// Top-level config file structure. Sections other tools read are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub paths: PathsSection,
}

/// `[broker]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            replay_capacity: default_replay_capacity(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            queue_depth: default_queue_depth(),
            drain_timeout_ms: default_drain_timeout_ms(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

/// `[paths]` section, shared with the `tether` CLI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsSection {
    pub socket_dir: Option<String>,
    pub registry_dir: Option<String>,
}

fn default_replay_capacity() -> usize {
    DEFAULT_REPLAY_CAPACITY
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_queue_depth() -> usize {
    1024
}
fn default_drain_timeout_ms() -> u64 {
    500
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}

impl ConfigFile {
    /// Read a config file; a missing file yields defaults.
    pub fn read(path: &Path) -> TetherResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        info!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| TetherError::Other(format!("config parse error: {e}")))
    }
}

/// Values given on the `tetherd` command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub session_id: String,
    pub scope_key: String,
    pub socket: Option<PathBuf>,
    pub socket_dir: Option<PathBuf>,
    pub registry_dir: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub env: Vec<(String, String)>,
    pub replay_capacity: Option<usize>,
    pub command: Vec<String>,
}

/// Resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub session_id: String,
    pub scope_key: String,
    pub socket_path: PathBuf,
    /// When set, the broker removes its own registry entry on shutdown.
    pub registry_dir: Option<PathBuf>,
    pub process: ProcessSpec,
    pub rows: u16,
    pub cols: u16,
    pub replay_capacity: usize,
    pub handshake_timeout: Duration,
    pub queue_depth: usize,
    pub drain_timeout: Duration,
}

impl BrokerConfig {
    /// Defaults for everything except identity, socket and process.
    pub fn new(session_id: &str, scope_key: &str, socket_path: PathBuf, process: ProcessSpec) -> Self {
        let broker = BrokerSection::default();
        Self {
            session_id: session_id.to_string(),
            scope_key: scope_key.to_string(),
            socket_path,
            registry_dir: None,
            process,
            rows: broker.rows,
            cols: broker.cols,
            replay_capacity: broker.replay_capacity,
            handshake_timeout: Duration::from_millis(broker.handshake_timeout_ms),
            queue_depth: broker.queue_depth,
            drain_timeout: Duration::from_millis(broker.drain_timeout_ms),
        }
    }

    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> TetherResult<Self> {
        let file = match config_path {
            Some(path) => ConfigFile::read(path)?,
            None => ConfigFile::default(),
        };
        Self::resolve(file, cli)
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> TetherResult<Self> {
        validate_id("session id", &cli.session_id)?;
        validate_id("scope key", &cli.scope_key)?;

        let socket_path = match cli.socket {
            Some(path) => path,
            None => {
                let dir = cli
                    .socket_dir
                    .or_else(|| file.paths.socket_dir.as_deref().map(expand_tilde))
                    .unwrap_or_else(naming::default_socket_dir);
                naming::socket_path(&dir, &cli.session_id, &cli.scope_key, std::process::id())
            }
        };
        let registry_dir = cli
            .registry_dir
            .or_else(|| file.paths.registry_dir.as_deref().map(expand_tilde));

        let mut process = match cli.command.split_first() {
            Some((program, args)) => ProcessSpec {
                program: program.clone(),
                args: args.to_vec(),
                env: HashMap::new(),
                cwd: None,
            },
            None => ProcessSpec::default_shell(),
        };
        process.env.extend(cli.env);
        process.cwd = cli.cwd;

        let broker = file.broker;
        Ok(Self {
            session_id: cli.session_id,
            scope_key: cli.scope_key,
            socket_path,
            registry_dir,
            process,
            rows: cli.rows.unwrap_or(broker.rows).max(1),
            cols: cli.cols.unwrap_or(broker.cols).max(1),
            replay_capacity: cli.replay_capacity.unwrap_or(broker.replay_capacity),
            handshake_timeout: Duration::from_millis(broker.handshake_timeout_ms),
            queue_depth: broker.queue_depth,
            drain_timeout: Duration::from_millis(broker.drain_timeout_ms),
        })
    }
}

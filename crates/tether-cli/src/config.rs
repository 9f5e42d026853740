//! Client configuration at `~/.tether/config.toml`.
//!
//! Shares the file with `tetherd`, which reads `[broker]` and `[paths]`.
//! CLI flags always override config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tether_core::naming::{self, expand_tilde};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    pub socket_dir: Option<String>,
    pub registry_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Unregistered sockets younger than this are left alone.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_marker_stale_secs")]
    pub marker_stale_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            grace_secs: default_grace_secs(),
            marker_stale_secs: default_marker_stale_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_detach_key")]
    pub detach_key: String,
    #[serde(default = "default_create_timeout_ms")]
    pub create_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Path to `tetherd`. Defaults to the one next to this binary.
    #[serde(default)]
    pub broker_program: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            detach_key: default_detach_key(),
            create_timeout_ms: default_create_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            broker_program: None,
        }
    }
}

fn default_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_grace_secs() -> u64 {
    15
}
fn default_marker_stale_secs() -> u64 {
    120
}
fn default_detach_key() -> String {
    "ctrl-]".to_string()
}
fn default_create_timeout_ms() -> u64 {
    10_000
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.paths
            .socket_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(naming::default_socket_dir)
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.paths
            .registry_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(naming::default_registry_dir)
    }

    pub fn broker_program(&self) -> PathBuf {
        if let Some(program) = &self.client.broker_program {
            return expand_tilde(program);
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("tetherd")))
            .filter(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from("tetherd"))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.client.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.reaper.interval_secs, 30);
        assert_eq!(cfg.reaper.grace_secs, 15);
        assert_eq!(cfg.client.detach_key, "ctrl-]");
        assert!(cfg.paths.socket_dir.is_none());
    }

    #[test]
    fn parse_partial_toml_config() {
        let toml_str = r#"
[paths]
socket_dir = "/run/user/1000/tether"

[reaper]
interval_secs = 5

[broker]
queue_depth = 8
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.socket_dir(), PathBuf::from("/run/user/1000/tether"));
        assert_eq!(cfg.reaper.interval_secs, 5);
        assert_eq!(cfg.reaper.probe_timeout_ms, 2_000);
        assert_eq!(cfg.client.create_timeout_ms, 10_000);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.client.handshake_timeout_ms, 5_000);
    }

    #[test]
    fn explicit_broker_program_wins() {
        let cfg: Config = toml::from_str("[client]\nbroker_program = \"/opt/bin/tetherd\"\n").unwrap();
        assert_eq!(cfg.broker_program(), PathBuf::from("/opt/bin/tetherd"));
    }
}

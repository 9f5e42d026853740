use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tether_client::{CreateRequest, LauncherConfig, SessionLauncher};
use tether_core::Capability;

use super::{attach, registry, resolve_scope};
use crate::config::Config;
use crate::{terminal, ScopeArgs};

pub async fn run(
    cfg: &Config,
    session_id: Option<String>,
    scope: &ScopeArgs,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    command: Vec<String>,
    attach_after: bool,
) -> Result<()> {
    let scope_key = resolve_scope(scope)?;
    let launcher = SessionLauncher::new(
        LauncherConfig {
            broker_program: cfg.broker_program(),
            registry_dir: Some(cfg.registry_dir()),
            create_timeout: Duration::from_millis(cfg.client.create_timeout_ms),
            ..LauncherConfig::new(cfg.socket_dir())
        },
        registry(cfg),
    );

    let (rows, cols) = terminal::size();
    let cwd = match cwd {
        Some(dir) => Some(dir),
        None => Some(std::env::current_dir().context("cannot determine current directory")?),
    };
    let entry = launcher
        .create(CreateRequest {
            session_id,
            scope_key,
            command,
            cwd,
            env,
            rows: Some(rows),
            cols: Some(cols),
        })
        .await
        .context("failed to create session")?;

    if attach_after {
        attach::attach_to(cfg, &entry.socket_path, Capability::Controller, None).await
    } else {
        println!("{}", entry.session_id);
        Ok(())
    }
}

//! Signal, resize and destroy without attaching.

use std::time::Duration;

use anyhow::{Context, Result};
use tether_client::{destroy_session, discovery, resize_session, signal_session};
use tether_core::SignalKind;

use super::{connect_config, registry, resolve_scope};
use crate::config::Config;
use crate::SessionArgs;

const DESTROY_WAIT: Duration = Duration::from_secs(5);

pub async fn signal(cfg: &Config, target: &SessionArgs, kind: &str) -> Result<()> {
    let kind: SignalKind = kind.parse()?;
    let scope_key = resolve_scope(&target.scope)?;
    let socket = discovery::resolve(registry(cfg).as_ref(), &cfg.socket_dir(), &target.session, &scope_key)?;
    signal_session(&socket, kind, connect_config(cfg))
        .await
        .with_context(|| format!("failed to signal {}", target.session))
}

pub async fn resize(cfg: &Config, target: &SessionArgs, rows: u16, cols: u16) -> Result<()> {
    anyhow::ensure!(rows > 0 && cols > 0, "rows and cols must be positive");
    let scope_key = resolve_scope(&target.scope)?;
    let socket = discovery::resolve(registry(cfg).as_ref(), &cfg.socket_dir(), &target.session, &scope_key)?;
    resize_session(&socket, rows, cols, connect_config(cfg)).await?;
    Ok(())
}

pub async fn destroy(cfg: &Config, target: &SessionArgs) -> Result<()> {
    let scope_key = resolve_scope(&target.scope)?;
    destroy_session(
        registry(cfg).as_ref(),
        &cfg.socket_dir(),
        &target.session,
        &scope_key,
        DESTROY_WAIT,
    )
    .await
    .with_context(|| format!("failed to destroy {}", target.session))?;
    println!("Destroyed {}", target.session);
    Ok(())
}

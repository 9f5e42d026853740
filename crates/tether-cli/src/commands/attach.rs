//! Interactive attach with local detach.

use std::path::Path;

use anyhow::{Context, Result};
use tether_client::attach::{self, parse_detach_key, AttachOutcome};
use tether_client::{discovery, BrokerClient, ConnectConfig};
use tether_core::Capability;
use tokio::sync::mpsc;
use tracing::debug;

use super::{connect_config, registry, resolve_scope};
use crate::config::Config;
use crate::terminal::{self, RawModeGuard};
use crate::SessionArgs;

pub async fn run(cfg: &Config, target: &SessionArgs, viewer: bool, detach_key: Option<&str>) -> Result<()> {
    let scope_key = resolve_scope(&target.scope)?;
    let socket = discovery::resolve(
        registry(cfg).as_ref(),
        &cfg.socket_dir(),
        &target.session,
        &scope_key,
    )?;
    let capability = if viewer {
        Capability::Viewer
    } else {
        Capability::Controller
    };
    attach_to(cfg, &socket, capability, detach_key).await
}

/// Attach to the broker at `socket` until detach, exit or disconnect.
pub async fn attach_to(
    cfg: &Config,
    socket: &Path,
    capability: Capability,
    detach_key: Option<&str>,
) -> Result<()> {
    let key = parse_detach_key(detach_key.unwrap_or(&cfg.client.detach_key))?;
    let connect = ConnectConfig {
        capability,
        ..connect_config(cfg)
    };
    let attachment = BrokerClient::connect(socket, connect)
        .await
        .with_context(|| format!("failed to attach to {}", socket.display()))?;
    let session_id = attachment.welcome.session_id.clone();
    debug!(%session_id, %capability, "attached");

    let (resize_tx, resize_rx) = mpsc::channel(8);
    // Viewers would otherwise fight the controller over the size.
    if capability == Capability::Controller {
        resize_tx.send(terminal::size()).await.ok();
        terminal::spawn_resize_watcher(resize_tx)?;
    } else {
        drop(resize_tx);
    }
    let input = terminal::spawn_stdin_reader();

    let guard = RawModeGuard::enter()?;
    let outcome = attach::run(attachment, input, resize_rx, tokio::io::stdout(), key).await;
    drop(guard);

    match outcome? {
        AttachOutcome::Detached => eprintln!("\r\n[detached from {session_id}]"),
        AttachOutcome::Exited(Some(code)) => eprintln!("\r\n[{session_id} exited with code {code}]"),
        AttachOutcome::Exited(None) => eprintln!("\r\n[{session_id} exited]"),
        AttachOutcome::Closed => eprintln!("\r\n[connection to {session_id} closed]"),
    }
    Ok(())
}

//! One-shot operations for orchestrators: signal, resize, destroy, list.
//!
//! Signalling needs the controller capability, so it displaces whichever
//! controller is currently attached.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tether_core::{Capability, SessionRegistry, SignalKind, TetherError, TetherResult};
use tokio::time;
use tracing::{debug, info, warn};

use crate::client::{AttachmentReader, AttachmentWriter, BrokerClient, ConnectConfig, SessionEvent};
use crate::discovery::{resolve, scan_sockets};
use crate::probe::{probe, Liveness};

const LINGER: Duration = Duration::from_secs(1);

/// Deliver a signal to a session's process.
pub async fn signal_session(socket: &Path, kind: SignalKind, config: ConnectConfig) -> TetherResult<()> {
    let config = ConnectConfig {
        capability: Capability::Controller,
        ..config
    };
    let attachment = BrokerClient::connect(socket, config).await?;
    let (reader, mut writer) = attachment.split();
    writer.signal(kind).await?;
    finish(reader, writer).await?;
    debug!(socket = %socket.display(), ?kind, "signal sent");
    Ok(())
}

/// Resize a session's terminal. Viewers may resize, so this does not
/// disturb the controller.
pub async fn resize_session(socket: &Path, rows: u16, cols: u16, config: ConnectConfig) -> TetherResult<()> {
    let config = ConnectConfig {
        capability: Capability::Viewer,
        ..config
    };
    let attachment = BrokerClient::connect(socket, config).await?;
    let (reader, mut writer) = attachment.split();
    writer.resize(rows, cols).await?;
    finish(reader, writer).await
}

/// Half-close, then keep reading until the broker hangs up so that it has
/// dispatched everything we sent.
async fn finish(mut reader: AttachmentReader, writer: AttachmentWriter) -> TetherResult<()> {
    writer.close().await?;
    let _ = time::timeout(LINGER, async {
        while let Ok(SessionEvent::Data(_)) = reader.next_event().await {}
    })
    .await;
    Ok(())
}

/// Terminate a session and forget it.
///
/// Sends `terminate` and waits up to `wait` for the socket to disappear.
/// A process that ignores it gets `kill` and another `wait`. The registry
/// entry is removed only once the broker is gone.
pub async fn destroy_session(
    registry: &dyn SessionRegistry,
    socket_dir: &Path,
    session_id: &str,
    scope_key: &str,
    wait: Duration,
) -> TetherResult<()> {
    let socket = resolve(registry, socket_dir, session_id, scope_key)?;
    signal_session(&socket, SignalKind::Terminate, ConnectConfig::default()).await?;

    if !wait_for_removal(&socket, wait).await {
        warn!(session_id, scope_key, "session ignored terminate, killing");
        match signal_session(&socket, SignalKind::Kill, ConnectConfig::default()).await {
            Ok(()) => {}
            // Went away between the two signals.
            Err(TetherError::Unreachable { .. }) => {}
            Err(e) => return Err(e),
        }
        if !wait_for_removal(&socket, wait).await {
            return Err(TetherError::Other(format!(
                "session `{session_id}` (scope `{scope_key}`) is still running after kill"
            )));
        }
    }

    registry.remove_if_socket(session_id, scope_key, &socket)?;
    info!(session_id, scope_key, "session destroyed");
    Ok(())
}

/// Whether the broker removed its socket within `wait`.
async fn wait_for_removal(socket: &Path, wait: Duration) -> bool {
    let deadline = time::Instant::now() + wait;
    while socket.exists() {
        if time::Instant::now() >= deadline {
            return false;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    true
}

/// A known session and whether its broker answers.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub session_id: String,
    pub scope_key: String,
    pub socket_path: PathBuf,
    pub registered: bool,
    pub liveness: Liveness,
}

/// Every session in the registry or the socket directory, probed.
pub async fn list_sessions(
    registry: &dyn SessionRegistry,
    socket_dir: &Path,
    probe_timeout: Duration,
) -> TetherResult<Vec<SessionStatus>> {
    let mut found: HashMap<PathBuf, (String, String, bool)> = HashMap::new();
    for entry in registry.list()? {
        found.insert(entry.socket_path, (entry.session_id, entry.scope_key, true));
    }
    for file in scan_sockets(socket_dir)? {
        found
            .entry(file.path)
            .or_insert((file.name.session_id, file.name.scope_key, false));
    }

    let mut statuses = Vec::with_capacity(found.len());
    for (socket_path, (session_id, scope_key, registered)) in found {
        let liveness = probe(&socket_path, probe_timeout).await;
        statuses.push(SessionStatus {
            session_id,
            scope_key,
            socket_path,
            registered,
            liveness,
        });
    }
    statuses.sort_by(|a, b| (&a.scope_key, &a.session_id).cmp(&(&b.scope_key, &b.session_id)));
    Ok(statuses)
}

//! Session loop: owns the PTY child and the listening socket.
//!
//! Connection tasks never touch the process directly. They send `Command`s
//! here, and process output is fanned out through the `Broker`.

use std::future::Future;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use std::time::Duration;

use tether_core::{FileRegistry, SessionRegistry, TetherError, TetherResult};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Command};
use crate::config::BrokerConfig;
use crate::connection::serve_connection;
use crate::session::pty::{ProcessSpec, PtyEvent, PtyProcess};

const STALE_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// How the session loop ended.
enum Ending {
    Exited(Option<i32>),
    Stopped,
    SpawnFailed,
}

/// One broker: a PTY child exposed on a Unix socket.
pub struct SessionServer {
    config: BrokerConfig,
}

impl SessionServer {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Serve until the child exits or `shutdown` resolves. Returns the
    /// child's exit code when known.
    pub async fn run<F>(self, shutdown: F) -> TetherResult<Option<i32>>
    where
        F: Future<Output = ()>,
    {
        let cfg = self.config;
        prepare_socket_path(&cfg.socket_path).await?;

        let (event_tx, mut events) = mpsc::channel::<PtyEvent>(256);
        let (command_tx, mut commands) = mpsc::channel::<Command>(256);

        let mut generation = 1;
        let mut output_closed = false;
        let mut process = PtyProcess::spawn(&cfg.process, cfg.rows, cfg.cols, generation, event_tx.clone())?;

        let listener = match bind_socket(&cfg.socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = process.kill();
                return Err(e);
            }
        };
        let broker = Broker::new(
            &cfg.session_id,
            &cfg.scope_key,
            cfg.replay_capacity,
            cfg.queue_depth,
            (cfg.rows, cfg.cols),
            command_tx,
        );
        info!(
            session_id = %cfg.session_id,
            scope_key = %cfg.scope_key,
            socket = %cfg.socket_path.display(),
            pid = std::process::id(),
            "broker listening"
        );

        let mut conns = JoinSet::new();
        tokio::pin!(shutdown);

        let ending = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        conns.spawn(serve_connection(broker.clone(), stream, cfg.handshake_timeout));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(event) = events.recv() => match event {
                    PtyEvent::Output { generation: g, data } if g == generation => broker.ingest_output(&data),
                    PtyEvent::Exited { generation: g, code } if g == generation => break Ending::Exited(code),
                    PtyEvent::Eof { generation: g } if g == generation => {
                        debug!(generation, "PTY output closed, waiting for exit status");
                        output_closed = true;
                    }
                    _ => debug!("event from replaced child ignored"),
                },
                Some(command) = commands.recv() => match command {
                    Command::Input(bytes) => {
                        if let Err(e) = process.write_input(bytes) {
                            debug!(error = %e, "dropping input");
                        }
                    }
                    Command::Resize { rows, cols } => {
                        if rows == 0 || cols == 0 {
                            debug!(rows, cols, "ignoring degenerate resize");
                        } else if let Err(e) = process.resize(rows, cols) {
                            warn!(error = %e, "resize failed");
                        } else {
                            broker.set_size(rows, cols);
                        }
                    }
                    Command::Signal(kind) => {
                        info!(?kind, pid = ?process.pid(), generation = process.generation(), "delivering signal");
                        if let Err(e) = process.signal(kind) {
                            warn!(error = %e, "signal delivery failed");
                        }
                    }
                    Command::Spawn(payload) => {
                        let spec = ProcessSpec::from(payload);
                        info!(program = %spec.program, "replacing session process");
                        if let Err(e) = process.kill() {
                            warn!(error = %e, pid = ?process.pid(), "failed to kill replaced process");
                        }
                        generation += 1;
                        output_closed = false;
                        let (rows, cols) = process.size();
                        match PtyProcess::spawn(&spec, rows, cols, generation, event_tx.clone()) {
                            Ok(next) => process = next,
                            Err(e) => {
                                error!(error = %e, "replacement process failed to start");
                                break Ending::SpawnFailed;
                            }
                        }
                    }
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                _ = &mut shutdown => break Ending::Stopped,
            }
        };

        let code = match ending {
            Ending::Exited(code) => {
                if !output_closed {
                    drain_output(&mut events, generation, &broker, cfg.drain_timeout).await;
                }
                code
            }
            Ending::Stopped => {
                info!("stop requested, terminating session process");
                terminate(&mut process, &mut events, generation, &broker).await
            }
            Ending::SpawnFailed => None,
        };

        broker.close_all(code);
        drop(listener);
        remove_socket(&cfg.socket_path);
        if let Some(dir) = &cfg.registry_dir {
            let registry = FileRegistry::new(dir);
            match registry.remove_if_socket(&cfg.session_id, &cfg.scope_key, &cfg.socket_path) {
                Ok(true) => debug!("registry entry removed"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "failed to remove registry entry"),
            }
        }

        // Give connection tasks a moment to flush EXIT before closing.
        let flushed = timeout(FLUSH_TIMEOUT, async {
            while conns.join_next().await.is_some() {}
        })
        .await;
        if flushed.is_err() {
            conns.abort_all();
        }

        info!(session_id = %cfg.session_id, ?code, "broker stopped");
        Ok(code)
    }
}

/// Collect output still in flight after the child exited.
async fn drain_output(
    events: &mut mpsc::Receiver<PtyEvent>,
    generation: u64,
    broker: &Broker,
    limit: Duration,
) {
    let deadline = Instant::now() + limit;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(PtyEvent::Output { generation: g, data })) if g == generation => {
                broker.ingest_output(&data)
            }
            Ok(Some(PtyEvent::Eof { generation: g })) if g == generation => return,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return,
        }
    }
}

/// SIGTERM the child, escalating to SIGKILL, while still forwarding output.
async fn terminate(
    process: &mut PtyProcess,
    events: &mut mpsc::Receiver<PtyEvent>,
    generation: u64,
    broker: &Broker,
) -> Option<i32> {
    if let Err(e) = process.signal(tether_core::SignalKind::Terminate) {
        debug!(error = %e, "SIGTERM failed");
    }
    if let Some(code) = wait_exit(events, generation, broker, TERMINATE_GRACE).await {
        return code;
    }
    warn!("session process ignored SIGTERM, killing");
    if let Err(e) = process.kill() {
        warn!(error = %e, pid = ?process.pid(), "kill failed");
    }
    wait_exit(events, generation, broker, TERMINATE_GRACE).await.flatten()
}

async fn wait_exit(
    events: &mut mpsc::Receiver<PtyEvent>,
    generation: u64,
    broker: &Broker,
    limit: Duration,
) -> Option<Option<i32>> {
    let deadline = Instant::now() + limit;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(PtyEvent::Output { generation: g, data })) if g == generation => {
                broker.ingest_output(&data)
            }
            Ok(Some(PtyEvent::Exited { generation: g, code })) if g == generation => return Some(code),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Create the socket directory and clear a stale socket left by a dead broker.
async fn prepare_socket_path(path: &Path) -> TetherResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).ok();
    }

    match std::fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_socket() {
                return Err(TetherError::Other(format!(
                    "refusing to replace {}: not a socket",
                    path.display()
                )));
            }
            match timeout(STALE_PROBE_TIMEOUT, UnixStream::connect(path)).await {
                Ok(Err(_)) => {
                    std::fs::remove_file(path)?;
                    info!(path = %path.display(), "removed stale socket");
                }
                // Accepting, or too slow to tell: leave it alone.
                _ => {
                    return Err(TetherError::Io(std::io::Error::new(
                        ErrorKind::AddrInUse,
                        format!("another broker is serving {}", path.display()),
                    )))
                }
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn bind_socket(path: &Path) -> TetherResult<UnixListener> {
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "socket removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove socket"),
    }
}

//! Session creation with defensive cleanup.
//!
//! A broker is started as a detached `tetherd` process. Creation counts as
//! successful only once its socket answers a handshake naming the requested
//! session. On any failure the spawned process is stopped and reaped, its
//! socket is removed, and no registry entry is written.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tether_core::naming::{self, validate_id};
use tether_core::{RegistryEntry, SessionRegistry, TetherError, TetherResult};
use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::client::{BrokerClient, ConnectConfig};
use crate::probe::{probe, Liveness};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Covers the broker's own terminate-then-kill of its process.
const TERM_WAIT: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Broker executable, `tetherd` on `$PATH` by default.
    pub broker_program: PathBuf,
    pub socket_dir: PathBuf,
    /// Passed to the broker so it can drop its own entry on shutdown.
    pub registry_dir: Option<PathBuf>,
    /// Budget for spawn + socket + handshake.
    pub create_timeout: Duration,
}

impl LauncherConfig {
    pub fn new(socket_dir: PathBuf) -> Self {
        Self {
            broker_program: PathBuf::from("tetherd"),
            socket_dir,
            registry_dir: None,
            create_timeout: Duration::from_secs(10),
        }
    }
}

/// What to start.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Generated when absent.
    pub session_id: Option<String>,
    pub scope_key: String,
    /// Program and arguments; the broker falls back to `$SHELL` when empty.
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

pub struct SessionLauncher {
    config: LauncherConfig,
    registry: Arc<dyn SessionRegistry>,
}

impl SessionLauncher {
    pub fn new(config: LauncherConfig, registry: Arc<dyn SessionRegistry>) -> Self {
        Self { config, registry }
    }

    /// Start a broker and register it. Leaves nothing behind on failure.
    pub async fn create(&self, request: CreateRequest) -> TetherResult<RegistryEntry> {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(naming::generate_session_id);
        validate_id("session id", &session_id)?;
        validate_id("scope key", &request.scope_key)?;

        if let Some(existing) = self.registry.lookup(&session_id, &request.scope_key)? {
            if probe(&existing.socket_path, Duration::from_secs(1)).await != Liveness::Dead {
                return Err(TetherError::Other(format!(
                    "session `{session_id}` (scope `{}`) is already running at {}",
                    request.scope_key,
                    existing.socket_path.display()
                )));
            }
        }

        let dir = &self.config.socket_dir;
        std::fs::create_dir_all(dir)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).ok();
        }

        let marker = naming::marker_path(dir, &session_id, &request.scope_key);
        std::fs::write(&marker, std::process::id().to_string())?;
        let result = self.launch(&session_id, &request).await;
        if let Err(e) = std::fs::remove_file(&marker) {
            warn!(path = %marker.display(), error = %e, "failed to remove creation marker");
        }
        result
    }

    async fn launch(&self, session_id: &str, request: &CreateRequest) -> TetherResult<RegistryEntry> {
        let mut cmd = self.broker_command(session_id, request);
        let mut child = cmd
            .spawn()
            .map_err(|e| TetherError::Spawn(format!("{}: {e}", self.config.broker_program.display())))?;
        let Some(pid) = child.id() else {
            let _ = child.wait().await;
            return Err(TetherError::Spawn("broker exited immediately".into()));
        };
        let socket = naming::socket_path(&self.config.socket_dir, session_id, &request.scope_key, pid);
        debug!(session_id, pid, socket = %socket.display(), "broker spawned, waiting for socket");

        let ready = time::timeout(
            self.config.create_timeout,
            wait_ready(&mut child, &socket, session_id, &request.scope_key),
        )
        .await
        .unwrap_or(Err(TetherError::Timeout("broker readiness")));

        if let Err(e) = ready {
            error!(session_id, pid, error = %e, "session creation failed, cleaning up");
            discard(&mut child, pid, &socket).await;
            return Err(e);
        }

        let entry = RegistryEntry::new(session_id, &request.scope_key, socket.clone(), Some(pid));
        if let Err(e) = self.registry.put(&entry) {
            error!(session_id, error = %e, "failed to register session, cleaning up");
            discard(&mut child, pid, &socket).await;
            return Err(e);
        }
        info!(session_id, scope_key = %request.scope_key, pid, "session created");
        Ok(entry)
    }

    fn broker_command(&self, session_id: &str, request: &CreateRequest) -> Command {
        let mut cmd = Command::new(&self.config.broker_program);
        cmd.arg("--session-id")
            .arg(session_id)
            .arg("--scope")
            .arg(&request.scope_key)
            .arg("--socket-dir")
            .arg(&self.config.socket_dir);
        if let Some(dir) = &self.config.registry_dir {
            cmd.arg("--registry-dir").arg(dir);
        }
        if let Some(cwd) = &request.cwd {
            cmd.arg("--cwd").arg(cwd);
        }
        if let Some(rows) = request.rows {
            cmd.arg("--rows").arg(rows.to_string());
        }
        if let Some(cols) = request.cols {
            cmd.arg("--cols").arg(cols.to_string());
        }
        for (key, value) in &request.env {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }
        if !request.command.is_empty() {
            cmd.arg("--").args(&request.command);
        }
        // Detached from our terminal: no shared stdio, own process group.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(false);
        cmd
    }
}

/// Poll until the socket completes a handshake for the right session.
async fn wait_ready(child: &mut Child, socket: &Path, session_id: &str, scope_key: &str) -> TetherResult<()> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(TetherError::Spawn(format!(
                "broker exited with {status} before becoming ready"
            )));
        }
        if socket.exists() {
            match BrokerClient::connect(socket, ConnectConfig::viewer()).await {
                Ok(attachment) => {
                    let welcome = &attachment.welcome;
                    if welcome.session_id != session_id || welcome.scope_key != scope_key {
                        return Err(TetherError::Handshake(format!(
                            "socket answered for session `{}` (scope `{}`)",
                            welcome.session_id, welcome.scope_key
                        )));
                    }
                    return Ok(());
                }
                // Bound but not yet accepting.
                Err(TetherError::Unreachable { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        time::sleep(POLL_INTERVAL).await;
    }
}

/// Stop and reap `child`, confirm it is gone, and remove its socket.
///
/// SIGTERM comes first so a broker that got as far as starting its process
/// can take it down with it. SIGKILL follows only if that does not work.
async fn discard(child: &mut Child, pid: u32, socket: &Path) {
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed (already exited?)");
    }
    match time::timeout(TERM_WAIT, child.wait()).await {
        Ok(Ok(status)) => debug!(pid, %status, "broker exited after SIGTERM"),
        Ok(Err(e)) => warn!(pid, error = %e, "failed to reap broker"),
        Err(_) => {
            warn!(pid, "broker ignored SIGTERM, killing");
            if let Err(e) = child.start_kill() {
                debug!(pid, error = %e, "kill failed (already exited?)");
            }
            match time::timeout(KILL_WAIT, child.wait()).await {
                Ok(Ok(status)) => debug!(pid, %status, "broker reaped"),
                Ok(Err(e)) => warn!(pid, error = %e, "failed to reap broker"),
                Err(_) => warn!(pid, "broker did not exit after SIGKILL"),
            }
        }
    }
    if is_process_alive(pid) {
        error!(pid, "broker still alive after cleanup");
    }
    match std::fs::remove_file(socket) {
        Ok(()) => debug!(path = %socket.display(), "socket removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %socket.display(), error = %e, "failed to remove socket"),
    }
}

/// Signal 0 probe. A reaped pid reports `ESRCH`.
pub fn is_process_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // Exists but belongs to someone else.
        Err(_) => true,
    }
}

//! PTY child process using portable-pty.
//!
//! The blocking master reader, the input writer and the exit waiter each run
//! on their own thread and report back through channels, so the broker's
//! event loop never blocks on the terminal.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tether_core::{SignalKind, SpawnPayload, TetherError, TetherResult};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 16 * 1024;

/// What to run inside the PTY.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    /// The user's login shell, falling back to `/bin/sh`.
    pub fn default_shell() -> Self {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        Self {
            program: shell,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }
}

impl From<SpawnPayload> for ProcessSpec {
    fn from(p: SpawnPayload) -> Self {
        Self {
            program: p.command,
            args: p.args,
            env: p.env,
            cwd: p.cwd.map(PathBuf::from),
        }
    }
}

/// Events reported by a child's helper threads. `generation` tells a
/// replaced child's stragglers apart from the current one.
#[derive(Debug)]
pub enum PtyEvent {
    Output { generation: u64, data: Vec<u8> },
    /// The master side reached end of stream.
    Eof { generation: u64 },
    Exited { generation: u64, code: Option<i32> },
}

/// A running child attached to a PTY.
pub struct PtyProcess {
    generation: u64,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    input: std_mpsc::Sender<Vec<u8>>,
    rows: u16,
    cols: u16,
}

impl PtyProcess {
    /// Spawn `spec` in a fresh PTY of the given size.
    pub fn spawn(
        spec: &ProcessSpec,
        rows: u16,
        cols: u16,
        generation: u64,
        events: mpsc::Sender<PtyEvent>,
    ) -> TetherResult<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(rows, cols))
            .map_err(|e| TetherError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TetherError::Spawn(format!("{}: {e}", spec.program)))?;
        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        info!(program = %spec.program, pid, rows, cols, generation, "PTY child spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TetherError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TetherError::Spawn(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        spawn_reader(reader, generation, events.clone())?;
        let input = spawn_writer(writer, generation)?;

        std::thread::Builder::new()
            .name(format!("pty-wait-{generation}"))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => Some(status.exit_code() as i32),
                    Err(e) => {
                        warn!(error = %e, "waiting for PTY child failed");
                        None
                    }
                };
                info!(?code, generation, "PTY child exited");
                let _ = events.blocking_send(PtyEvent::Exited { generation, code });
            })?;

        Ok(Self {
            generation,
            master: pair.master,
            killer,
            pid,
            input,
            rows,
            cols,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn size(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }

    /// Queue bytes for the child's input. Never blocks.
    pub fn write_input(&self, data: Vec<u8>) -> TetherResult<()> {
        self.input
            .send(data)
            .map_err(|_| TetherError::Other("PTY input closed".into()))
    }

    pub fn resize(&mut self, rows: u16, cols: u16) -> TetherResult<()> {
        self.master
            .resize(pty_size(rows, cols))
            .map_err(|e| TetherError::Other(format!("PTY resize failed: {e}")))?;
        self.rows = rows;
        self.cols = cols;
        debug!(rows, cols, "PTY resized");
        Ok(())
    }

    pub fn signal(&mut self, kind: SignalKind) -> TetherResult<()> {
        let sig = match kind {
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
            SignalKind::Hangup => Signal::SIGHUP,
        };
        match self.pid {
            Some(pid) => {
                signal::kill(Pid::from_raw(pid as i32), sig)
                    .map_err(|e| TetherError::Other(format!("kill({pid}, {sig}) failed: {e}")))?;
                debug!(pid, %sig, "signal delivered");
                Ok(())
            }
            None if sig == Signal::SIGKILL => self.kill(),
            None => Err(TetherError::Other("child has no pid".into())),
        }
    }

    /// Forcefully terminate the child. SIGKILL by pid when known: the
    /// portable-pty killer only sends SIGHUP, which the child may ignore.
    pub fn kill(&mut self) -> TetherResult<()> {
        if let Some(pid) = self.pid {
            return match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                // Already reaped.
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(TetherError::Other(format!("kill({pid}) failed: {e}"))),
            };
        }
        self.killer
            .kill()
            .map_err(|e| TetherError::Other(format!("kill failed: {e}")))
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    generation: u64,
    events: mpsc::Sender<PtyEvent>,
) -> TetherResult<()> {
    std::thread::Builder::new()
        .name(format!("pty-read-{generation}"))
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let event = PtyEvent::Output {
                            generation,
                            data: buf[..n].to_vec(),
                        };
                        if events.blocking_send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // Linux reports EIO once the slave side is gone.
                    Err(_) => break,
                }
            }
            let _ = events.blocking_send(PtyEvent::Eof { generation });
        })?;
    Ok(())
}

fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    generation: u64,
) -> TetherResult<std_mpsc::Sender<Vec<u8>>> {
    let (tx, rx) = std_mpsc::channel::<Vec<u8>>();
    std::thread::Builder::new()
        .name(format!("pty-write-{generation}"))
        .spawn(move || {
            for chunk in rx {
                if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                    debug!(error = %e, "PTY input write failed");
                    break;
                }
            }
        })?;
    Ok(tx)
}

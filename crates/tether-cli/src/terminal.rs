//! Local terminal handling: raw mode, size, and resize notifications.

use std::io::Read;

use anyhow::{Context, Result};
use crossterm::terminal;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Restores cooked mode on drop, including on early return or panic unwind.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!(error = %e, "failed to restore terminal mode");
        }
    }
}

/// Current terminal size as `(rows, cols)`, falling back to 24x80.
pub fn size() -> (u16, u16) {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (rows, cols),
        _ => (24, 80),
    }
}

/// Forward stdin in chunks. Runs on a plain thread because a blocking read
/// cannot be cancelled; it ends with the process.
pub fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Emit the terminal size on every SIGWINCH.
pub fn spawn_resize_watcher(tx: mpsc::Sender<(u16, u16)>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut winch = signal(SignalKind::window_change()).context("failed to watch SIGWINCH")?;
    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            if tx.send(size()).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}

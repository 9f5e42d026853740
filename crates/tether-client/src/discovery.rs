//! Resolve a `(session id, scope key)` to a broker socket.
//!
//! The registry is consulted first. If it has no usable record, the socket
//! directory is scanned for `tether-<session>.<scope>.<pid>.sock` and the
//! most recently modified match wins.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tether_core::naming::{self, parse_marker_file_name, parse_socket_file_name, SocketName};
use tether_core::{SessionRegistry, TetherError, TetherResult};
use tracing::{debug, warn};

/// A socket or marker file found in the socket directory.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub name: SocketName,
    pub path: PathBuf,
    pub modified: SystemTime,
}

pub fn resolve(
    registry: &dyn SessionRegistry,
    socket_dir: &Path,
    session_id: &str,
    scope_key: &str,
) -> TetherResult<PathBuf> {
    naming::validate_id("session id", session_id)?;
    naming::validate_id("scope key", scope_key)?;

    match registry.lookup(session_id, scope_key) {
        Ok(Some(entry)) if entry.socket_path.exists() => {
            debug!(session_id, path = %entry.socket_path.display(), "resolved from registry");
            return Ok(entry.socket_path);
        }
        Ok(Some(entry)) => {
            debug!(session_id, path = %entry.socket_path.display(), "registered socket missing, scanning");
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "registry lookup failed, scanning socket directory"),
    }

    match scan_for(socket_dir, session_id, scope_key)? {
        Some(path) => {
            debug!(session_id, path = %path.display(), "resolved from socket directory");
            Ok(path)
        }
        None => Err(TetherError::SessionNotFound {
            session_id: session_id.to_string(),
            scope_key: scope_key.to_string(),
        }),
    }
}

/// Newest socket in `dir` for one session and scope.
pub fn scan_for(dir: &Path, session_id: &str, scope_key: &str) -> TetherResult<Option<PathBuf>> {
    Ok(scan_sockets(dir)?
        .into_iter()
        .filter(|f| f.name.session_id == session_id && f.name.scope_key == scope_key)
        .max_by_key(|f| f.modified)
        .map(|f| f.path))
}

/// Every broker socket in `dir`. A missing directory is empty.
pub fn scan_sockets(dir: &Path) -> TetherResult<Vec<ScannedFile>> {
    scan_with(dir, parse_socket_file_name)
}

/// Every in-flight creation marker in `dir`.
pub fn scan_markers(dir: &Path) -> TetherResult<Vec<ScannedFile>> {
    scan_with(dir, parse_marker_file_name)
}

fn scan_with(dir: &Path, parse: fn(&str) -> Option<SocketName>) -> TetherResult<Vec<ScannedFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str().and_then(parse) else {
            continue;
        };
        // Raced with a removal; skip.
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        found.push(ScannedFile {
            name,
            path: entry.path(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    Ok(found)
}

//! Session identifiers, scope keys and socket-directory naming.
//!
//! A broker's socket is named `tether-<session>.<scope>.<pid>.sock`. Because
//! identifiers may not contain `.`, the name can be split back into its parts
//! when the registry has no record of a session.

use std::path::{Path, PathBuf};

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{TetherError, TetherResult};

pub const SOCKET_PREFIX: &str = "tether-";
pub const SOCKET_SUFFIX: &str = ".sock";
pub const MARKER_SUFFIX: &str = ".creating";

const MAX_ID_LEN: usize = 64;
const SCOPE_KEY_LEN: usize = 16;

/// Check that an identifier is safe to embed in a file name.
pub fn validate_id(what: &str, id: &str) -> TetherResult<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(TetherError::InvalidId(format!(
            "{what} must be 1-{MAX_ID_LEN} characters, got {}",
            id.len()
        )));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(TetherError::InvalidId(format!(
            "{what} `{id}` contains `{c}`; only letters, digits, `-` and `_` are allowed"
        )));
    }
    Ok(())
}

/// Generate a random 8-byte hex session id.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Derive the scope key for a workspace directory from its canonical path.
pub fn scope_for_workspace(workspace: &Path) -> TetherResult<String> {
    let canonical = workspace.canonicalize()?;
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    Ok(hex::encode(digest)[..SCOPE_KEY_LEN].to_string())
}

/// File name prefix shared by every socket of one `(session, scope)`.
pub fn socket_prefix(session_id: &str, scope_key: &str) -> String {
    format!("{SOCKET_PREFIX}{session_id}.{scope_key}.")
}

pub fn socket_file_name(session_id: &str, scope_key: &str, pid: u32) -> String {
    format!("{}{pid}{SOCKET_SUFFIX}", socket_prefix(session_id, scope_key))
}

pub fn socket_path(dir: &Path, session_id: &str, scope_key: &str, pid: u32) -> PathBuf {
    dir.join(socket_file_name(session_id, scope_key, pid))
}

/// Path of the marker announcing that a session is being created.
pub fn marker_path(dir: &Path, session_id: &str, scope_key: &str) -> PathBuf {
    dir.join(format!(
        "{SOCKET_PREFIX}{session_id}.{scope_key}{MARKER_SUFFIX}"
    ))
}

/// Components recovered from a socket or marker file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketName {
    pub session_id: String,
    pub scope_key: String,
    pub pid: Option<u32>,
}

/// Parse `tether-<session>.<scope>.<pid>.sock`.
pub fn parse_socket_file_name(name: &str) -> Option<SocketName> {
    let body = name.strip_prefix(SOCKET_PREFIX)?.strip_suffix(SOCKET_SUFFIX)?;
    let mut parts = body.split('.');
    let session_id = parts.next()?;
    let scope_key = parts.next()?;
    let pid = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    validate_id("session id", session_id).ok()?;
    validate_id("scope key", scope_key).ok()?;
    Some(SocketName {
        session_id: session_id.to_string(),
        scope_key: scope_key.to_string(),
        pid: Some(pid),
    })
}

/// Parse `tether-<session>.<scope>.creating`.
pub fn parse_marker_file_name(name: &str) -> Option<SocketName> {
    let body = name.strip_prefix(SOCKET_PREFIX)?.strip_suffix(MARKER_SUFFIX)?;
    let (session_id, scope_key) = body.split_once('.')?;
    validate_id("session id", session_id).ok()?;
    validate_id("scope key", scope_key).ok()?;
    Some(SocketName {
        session_id: session_id.to_string(),
        scope_key: scope_key.to_string(),
        pid: None,
    })
}

/// Default socket directory: `$XDG_RUNTIME_DIR/tether`, else `/tmp/tether-<uid>`.
pub fn default_socket_dir() -> PathBuf {
    match dirs::runtime_dir() {
        Some(runtime) => runtime.join("tether"),
        None => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/tether-{uid}"))
        }
    }
}

/// Base directory for configuration and the registry: `~/.tether`.
pub fn tether_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

pub fn default_registry_dir() -> PathBuf {
    tether_home().join("registry")
}

pub fn default_config_path() -> PathBuf {
    tether_home().join("config.toml")
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_restricted() {
        assert!(validate_id("session id", "build-42_a").is_ok());
        assert!(validate_id("session id", "").is_err());
        assert!(validate_id("session id", "a.b").is_err());
        assert!(validate_id("session id", "../etc").is_err());
        assert!(validate_id("session id", &"x".repeat(65)).is_err());
    }

    #[test]
    fn generated_ids_are_valid() {
        let id = generate_session_id();
        assert_eq!(id.len(), 16);
        validate_id("session id", &id).unwrap();
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn socket_name_parses_back() {
        let name = socket_file_name("agent-1", "0123abcd", 4242);
        assert_eq!(name, "tether-agent-1.0123abcd.4242.sock");
        assert_eq!(
            parse_socket_file_name(&name),
            Some(SocketName {
                session_id: "agent-1".into(),
                scope_key: "0123abcd".into(),
                pid: Some(4242),
            })
        );
        assert!(name.starts_with(&socket_prefix("agent-1", "0123abcd")));
    }

    #[test]
    fn foreign_files_do_not_parse() {
        assert_eq!(parse_socket_file_name("other.sock"), None);
        assert_eq!(parse_socket_file_name("tether-a.b.notapid.sock"), None);
        assert_eq!(parse_socket_file_name("tether-a.b.1.2.sock"), None);
        assert_eq!(parse_socket_file_name("tether-a.b.12.json"), None);
    }

    #[test]
    fn marker_name_parses_back() {
        let dir = Path::new("/run/tether");
        let marker = marker_path(dir, "s1", "scope");
        let name = marker.file_name().unwrap().to_str().unwrap();
        let parsed = parse_marker_file_name(name).unwrap();
        assert_eq!(parsed.session_id, "s1");
        assert_eq!(parsed.scope_key, "scope");
        assert_eq!(parsed.pid, None);
    }

    #[test]
    fn scope_key_is_stable_per_directory() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let ka = scope_for_workspace(a.path()).unwrap();
        assert_eq!(ka.len(), 16);
        assert_eq!(ka, scope_for_workspace(&a.path().join(".")).unwrap());
        assert_ne!(ka, scope_for_workspace(b.path()).unwrap());
    }

    #[test]
    fn tilde_expansion() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~/x/y"), home.join("x/y"));
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}

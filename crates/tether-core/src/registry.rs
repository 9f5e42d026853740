//! Session registry: durable mapping from `(session id, scope key)` to the
//! broker socket serving it.
//!
//! Lookups are always scoped, so two workspaces may reuse a session id.
//! When two records for one key race, the one with the latest `created_at`
//! is kept.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TetherError, TetherResult};
use crate::naming::validate_id;

/// One registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub session_id: String,
    pub scope_key: String,
    pub socket_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Broker process id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl RegistryEntry {
    pub fn new(session_id: &str, scope_key: &str, socket_path: PathBuf, pid: Option<u32>) -> Self {
        Self {
            session_id: session_id.to_string(),
            scope_key: scope_key.to_string(),
            socket_path,
            created_at: Utc::now(),
            pid,
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.session_id.clone(), self.scope_key.clone())
    }
}

/// Read/write contract of the durable session store.
pub trait SessionRegistry: Send + Sync {
    /// Insert or replace the entry for its key. An existing entry with a newer
    /// `created_at` is left in place.
    fn put(&self, entry: &RegistryEntry) -> TetherResult<()>;

    /// Remove the entry for a key. Returns whether anything was removed.
    fn remove(&self, session_id: &str, scope_key: &str) -> TetherResult<bool>;

    fn lookup(&self, session_id: &str, scope_key: &str) -> TetherResult<Option<RegistryEntry>>;

    fn list(&self) -> TetherResult<Vec<RegistryEntry>>;

    /// Remove the entry only while it still points at `socket_path`, so a
    /// broker tearing down never deletes its successor's record.
    fn remove_if_socket(
        &self,
        session_id: &str,
        scope_key: &str,
        socket_path: &Path,
    ) -> TetherResult<bool> {
        match self.lookup(session_id, scope_key)? {
            Some(entry) if entry.socket_path == socket_path => self.remove(session_id, scope_key),
            _ => Ok(false),
        }
    }
}

fn keep_existing(existing: Option<&RegistryEntry>, incoming: &RegistryEntry) -> bool {
    existing.is_some_and(|e| e.created_at > incoming.created_at)
}

// ── File-backed registry ──────────────────────────────────────────────

/// One JSON document per key at `<root>/<scope_key>/<session_id>.json`.
///
/// Writes go to a temporary file in the same directory and are renamed into
/// place, so readers never observe a partial record.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    root: PathBuf,
}

impl FileRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, session_id: &str, scope_key: &str) -> TetherResult<PathBuf> {
        validate_id("session id", session_id)?;
        validate_id("scope key", scope_key)?;
        Ok(self.root.join(scope_key).join(format!("{session_id}.json")))
    }

    fn read_entry(path: &Path) -> TetherResult<Option<RegistryEntry>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl SessionRegistry for FileRegistry {
    fn put(&self, entry: &RegistryEntry) -> TetherResult<()> {
        let path = self.entry_path(&entry.session_id, &entry.scope_key)?;
        // An unreadable record is overwritten rather than blocking registration.
        let existing = Self::read_entry(&path).ok().flatten();
        if keep_existing(existing.as_ref(), entry) {
            debug!(session_id = %entry.session_id, "newer registry entry already present");
            return Ok(());
        }

        let dir = path
            .parent()
            .ok_or_else(|| TetherError::Registry(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(
            ".{}.json.{}.tmp",
            entry.session_id,
            std::process::id()
        ));
        fs::write(&tmp, serde_json::to_vec_pretty(entry)?)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(session_id = %entry.session_id, scope_key = %entry.scope_key, "registry entry written");
        Ok(())
    }

    fn remove(&self, session_id: &str, scope_key: &str) -> TetherResult<bool> {
        let path = self.entry_path(session_id, scope_key)?;
        match fs::remove_file(&path) {
            // Scope directories are never removed: a concurrent `put` may sit
            // between its `create_dir_all` and its write.
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn lookup(&self, session_id: &str, scope_key: &str) -> TetherResult<Option<RegistryEntry>> {
        let path = self.entry_path(session_id, scope_key)?;
        let entry = Self::read_entry(&path)?;
        Ok(entry.filter(|e| e.session_id == session_id && e.scope_key == scope_key))
    }

    fn list(&self) -> TetherResult<Vec<RegistryEntry>> {
        let scopes = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for scope in scopes.flatten() {
            if !scope.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Ok(files) = fs::read_dir(scope.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                let is_record = path.extension().is_some_and(|ext| ext == "json")
                    && !file.file_name().to_string_lossy().starts_with('.');
                if !is_record {
                    continue;
                }
                match Self::read_entry(&path) {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable registry entry"),
                }
            }
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }
}

// ── In-memory registry ────────────────────────────────────────────────

/// Process-local registry, for embedding a broker and for tests.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: RwLock<HashMap<(String, String), RegistryEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> TetherError {
        TetherError::Registry("registry lock poisoned".into())
    }
}

impl SessionRegistry for MemoryRegistry {
    fn put(&self, entry: &RegistryEntry) -> TetherResult<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let key = entry.key();
        if keep_existing(entries.get(&key), entry) {
            return Ok(());
        }
        entries.insert(key, entry.clone());
        Ok(())
    }

    fn remove(&self, session_id: &str, scope_key: &str) -> TetherResult<bool> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        Ok(entries
            .remove(&(session_id.to_string(), scope_key.to_string()))
            .is_some())
    }

    fn lookup(&self, session_id: &str, scope_key: &str) -> TetherResult<Option<RegistryEntry>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .get(&(session_id.to_string(), scope_key.to_string()))
            .cloned())
    }

    fn list(&self) -> TetherResult<Vec<RegistryEntry>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let mut all: Vec<_> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(session: &str, scope: &str, sock: &str) -> RegistryEntry {
        RegistryEntry::new(session, scope, PathBuf::from(sock), Some(100))
    }

    fn exercise(reg: &dyn SessionRegistry) {
        reg.put(&entry("s1", "scopeA", "/run/a.sock")).unwrap();
        reg.put(&entry("s1", "scopeB", "/run/b.sock")).unwrap();

        let a = reg.lookup("s1", "scopeA").unwrap().unwrap();
        assert_eq!(a.socket_path, PathBuf::from("/run/a.sock"));
        let b = reg.lookup("s1", "scopeB").unwrap().unwrap();
        assert_eq!(b.socket_path, PathBuf::from("/run/b.sock"));
        assert!(reg.lookup("s1", "scopeC").unwrap().is_none());
        assert_eq!(reg.list().unwrap().len(), 2);

        assert!(reg.remove("s1", "scopeA").unwrap());
        assert!(!reg.remove("s1", "scopeA").unwrap());
        assert!(reg.lookup("s1", "scopeA").unwrap().is_none());
        assert!(reg.lookup("s1", "scopeB").unwrap().is_some());
    }

    fn newest_wins(reg: &dyn SessionRegistry) {
        let newer = entry("s", "k", "/run/new.sock");
        let mut older = entry("s", "k", "/run/old.sock");
        older.created_at = newer.created_at - Duration::seconds(5);

        reg.put(&newer).unwrap();
        reg.put(&older).unwrap();
        assert_eq!(
            reg.lookup("s", "k").unwrap().unwrap().socket_path,
            PathBuf::from("/run/new.sock")
        );
    }

    #[test]
    fn memory_registry_is_scoped() {
        exercise(&MemoryRegistry::new());
    }

    #[test]
    fn file_registry_is_scoped() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileRegistry::new(dir.path()));
    }

    #[test]
    fn both_registries_keep_newest() {
        newest_wins(&MemoryRegistry::new());
        let dir = tempfile::tempdir().unwrap();
        newest_wins(&FileRegistry::new(dir.path()));
    }

    #[test]
    fn remove_if_socket_ignores_successor() {
        let reg = MemoryRegistry::new();
        reg.put(&entry("s", "k", "/run/second.sock")).unwrap();
        assert!(!reg
            .remove_if_socket("s", "k", Path::new("/run/first.sock"))
            .unwrap());
        assert!(reg
            .remove_if_socket("s", "k", Path::new("/run/second.sock"))
            .unwrap());
    }

    #[test]
    fn file_registry_survives_garbage_and_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new(dir.path().join("missing"));
        assert!(reg.list().unwrap().is_empty());

        let reg = FileRegistry::new(dir.path());
        reg.put(&entry("good", "k", "/run/g.sock")).unwrap();
        fs::write(dir.path().join("k").join("bad.json"), b"{not json").unwrap();
        let listed = reg.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, "good");
    }

    #[test]
    fn file_registry_put_and_remove_race_in_one_scope() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new(dir.path());

        reg.put(&entry("only", "k", "/run/only.sock")).unwrap();
        assert!(reg.remove("only", "k").unwrap());
        assert!(dir.path().join("k").is_dir());

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..200 {
                    reg.put(&entry("churn", "k", "/run/churn.sock")).unwrap();
                    reg.remove("churn", "k").unwrap();
                }
            });
            s.spawn(|| {
                for i in 0..200 {
                    let id = format!("s{i}");
                    reg.put(&entry(&id, "k", "/run/s.sock")).unwrap();
                    reg.remove(&id, "k").unwrap();
                }
            });
        });
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn file_registry_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new(dir.path());
        assert!(reg.lookup("../escape", "k").is_err());
        assert!(reg.put(&entry("s", "a/b", "/x")).is_err());
    }
}

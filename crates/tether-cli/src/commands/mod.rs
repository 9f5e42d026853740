pub mod attach;
pub mod control;
pub mod create;
pub mod list;
pub mod reap;

use std::sync::Arc;

use anyhow::{Context, Result};
use tether_client::ConnectConfig;
use tether_core::naming::{scope_for_workspace, validate_id};
use tether_core::{FileRegistry, SessionRegistry};

use crate::config::Config;
use crate::ScopeArgs;

/// Parse `KEY=VALUE`.
pub fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

/// Explicit `--scope`, else the scope of `--workspace`, else of the
/// current directory.
pub fn resolve_scope(args: &ScopeArgs) -> Result<String> {
    if let Some(scope) = &args.scope {
        validate_id("scope key", scope)?;
        return Ok(scope.clone());
    }
    let workspace = match &args.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    scope_for_workspace(&workspace)
        .with_context(|| format!("cannot derive scope for {}", workspace.display()))
}

pub fn registry(cfg: &Config) -> Arc<dyn SessionRegistry> {
    Arc::new(FileRegistry::new(cfg.registry_dir()))
}

pub fn connect_config(cfg: &Config) -> ConnectConfig {
    ConnectConfig::default().with_timeout(cfg.handshake_timeout())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs() {
        assert_eq!(
            parse_env("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_env("novalue").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn explicit_scope_is_validated() {
        let ok = ScopeArgs {
            scope: Some("abc123".into()),
            workspace: None,
        };
        assert_eq!(resolve_scope(&ok).unwrap(), "abc123");

        let bad = ScopeArgs {
            scope: Some("../etc".into()),
            workspace: None,
        };
        assert!(resolve_scope(&bad).is_err());
    }

    #[test]
    fn workspace_scope_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let args = ScopeArgs {
            scope: None,
            workspace: Some(dir.path().to_path_buf()),
        };
        let first = resolve_scope(&args).unwrap();
        assert_eq!(first.len(), 16);
        assert_eq!(resolve_scope(&args).unwrap(), first);
    }
}

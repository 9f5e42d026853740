//! Periodic cleanup of sockets and registry entries left by dead brokers.
//!
//! A candidate is only purged once a probe says nothing is listening.
//! Sessions being created (marker present) and young unregistered sockets
//! are skipped, and unresponsive brokers are left alone.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tether_core::{SessionRegistry, TetherResult};
use tracing::{debug, info, warn};

use crate::discovery::{scan_markers, scan_sockets};
use crate::probe::{probe, Liveness};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub socket_dir: PathBuf,
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Unregistered sockets younger than this are not probed.
    pub grace: Duration,
    /// Creation markers older than this are treated as abandoned.
    pub marker_stale_after: Duration,
}

impl ReaperConfig {
    pub fn new(socket_dir: PathBuf) -> Self {
        Self {
            socket_dir,
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            grace: Duration::from_secs(15),
            marker_stale_after: Duration::from_secs(120),
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub examined: usize,
    pub alive: usize,
    pub unresponsive: usize,
    pub skipped_in_flight: usize,
    pub skipped_young: usize,
    /// Sockets (or registered paths) found dead and purged.
    pub purged: Vec<PathBuf>,
    pub registry_removed: usize,
    pub markers_removed: usize,
}

#[derive(Debug)]
struct Candidate {
    session_id: String,
    scope_key: String,
    socket_path: PathBuf,
    registered: bool,
    modified: Option<SystemTime>,
}

pub struct Reaper {
    config: ReaperConfig,
    registry: Arc<dyn SessionRegistry>,
}

impl Reaper {
    pub fn new(config: ReaperConfig, registry: Arc<dyn SessionRegistry>) -> Self {
        Self { config, registry }
    }

    /// One sweep over the registry and the socket directory.
    pub async fn run_once(&self) -> TetherResult<ReapReport> {
        let mut report = ReapReport::default();
        let now = SystemTime::now();

        let mut in_flight = HashSet::new();
        for marker in scan_markers(&self.config.socket_dir)? {
            if age(now, marker.modified) > self.config.marker_stale_after {
                match std::fs::remove_file(&marker.path) {
                    Ok(()) => {
                        report.markers_removed += 1;
                        info!(path = %marker.path.display(), "removed abandoned creation marker");
                    }
                    Err(e) => debug!(path = %marker.path.display(), error = %e, "marker already gone"),
                }
                continue;
            }
            in_flight.insert((marker.name.session_id, marker.name.scope_key));
        }

        for candidate in self.candidates()? {
            report.examined += 1;
            let key = (candidate.session_id.clone(), candidate.scope_key.clone());
            if in_flight.contains(&key) {
                debug!(session_id = %candidate.session_id, "creation in progress, skipping");
                report.skipped_in_flight += 1;
                continue;
            }
            if !candidate.registered {
                if let Some(modified) = candidate.modified {
                    if age(now, modified) < self.config.grace {
                        report.skipped_young += 1;
                        continue;
                    }
                }
            }

            match probe(&candidate.socket_path, self.config.probe_timeout).await {
                Liveness::Alive => report.alive += 1,
                Liveness::Unresponsive => {
                    warn!(
                        session_id = %candidate.session_id,
                        path = %candidate.socket_path.display(),
                        "broker unresponsive, keeping"
                    );
                    report.unresponsive += 1;
                }
                Liveness::Dead => self.purge(&candidate, &mut report),
            }
        }

        info!(
            examined = report.examined,
            purged = report.purged.len(),
            alive = report.alive,
            unresponsive = report.unresponsive,
            in_flight = report.skipped_in_flight,
            "reaper pass complete"
        );
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` resolves.
    pub async fn run<F: Future<Output = ()>>(&self, shutdown: F) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "reaper pass failed");
                    }
                }
                _ = &mut shutdown => break,
            }
        }
    }

    fn candidates(&self) -> TetherResult<Vec<Candidate>> {
        let registered = self.registry.list()?;
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for entry in registered {
            seen.insert(entry.socket_path.clone());
            candidates.push(Candidate {
                session_id: entry.session_id,
                scope_key: entry.scope_key,
                socket_path: entry.socket_path,
                registered: true,
                modified: None,
            });
        }
        for file in scan_sockets(&self.config.socket_dir)? {
            if seen.contains(&file.path) {
                continue;
            }
            candidates.push(Candidate {
                session_id: file.name.session_id,
                scope_key: file.name.scope_key,
                socket_path: file.path,
                registered: false,
                modified: Some(file.modified),
            });
        }
        Ok(candidates)
    }

    fn purge(&self, candidate: &Candidate, report: &mut ReapReport) {
        match std::fs::remove_file(&candidate.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %candidate.socket_path.display(), error = %e, "failed to remove dead socket");
                return;
            }
        }
        if candidate.registered {
            match self.registry.remove_if_socket(
                &candidate.session_id,
                &candidate.scope_key,
                &candidate.socket_path,
            ) {
                Ok(true) => report.registry_removed += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %candidate.session_id, error = %e, "failed to remove registry entry"),
            }
        }
        info!(
            session_id = %candidate.session_id,
            scope_key = %candidate.scope_key,
            path = %candidate.socket_path.display(),
            "purged dead session"
        );
        report.purged.push(candidate.socket_path.clone());
    }
}

fn age(now: SystemTime, then: SystemTime) -> Duration {
    now.duration_since(then).unwrap_or(Duration::ZERO)
}

//! Broker liveness probing.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tether_core::TetherError;
use tracing::debug;

use crate::client::{BrokerClient, ConnectConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Handshake completed.
    Alive,
    /// Something holds the socket but did not finish a handshake in time.
    /// Treated as possibly alive.
    Unresponsive,
    /// Socket missing or nobody listening.
    Dead,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Liveness::Alive => "alive",
            Liveness::Unresponsive => "unresponsive",
            Liveness::Dead => "dead",
        })
    }
}

/// Probe the broker behind `path` with a viewer handshake.
pub async fn probe(path: &Path, timeout: Duration) -> Liveness {
    if !path.exists() {
        return Liveness::Dead;
    }
    let liveness = match BrokerClient::connect(path, ConnectConfig::viewer().with_timeout(timeout)).await {
        Ok(_) => Liveness::Alive,
        Err(TetherError::Unreachable { source, .. })
            if matches!(source.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) =>
        {
            Liveness::Dead
        }
        Err(_) => Liveness::Unresponsive,
    };
    debug!(path = %path.display(), %liveness, "probed broker");
    liveness
}

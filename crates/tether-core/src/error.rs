use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the tether protocol, registry and lifecycle layers.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol major version mismatch: local {local}, peer {peer}")]
    VersionMismatch { local: u16, peer: u16 },

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("session `{session_id}` (scope `{scope_key}`) does not exist or is not running")]
    SessionNotFound {
        session_id: String,
        scope_key: String,
    },

    #[error(
        "cannot reach session socket {}: {source}; check that the session exists and its broker is running",
        path.display()
    )]
    Unreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for TetherError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TetherError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TetherError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TetherError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(e: serde_json::Error) -> Self {
        TetherError::Registry(e.to_string())
    }
}

pub type TetherResult<T> = Result<T, TetherError>;

//! Broker connection: handshake, then typed reads and writes.
//!
//! `BrokerClient::connect` returns an `Attachment` once WELCOME and the
//! single REPLAY frame have arrived; everything after that is live.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tether_core::frame::{ResizePayload, WelcomePayload};
use tether_core::{
    write_frame, Capability, Frame, FrameReader, SignalKind, SpawnPayload, TetherError, TetherResult,
};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time;
use tracing::debug;

/// Configuration for connecting to a broker.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub capability: Capability,
    /// Upper bound for connect + WELCOME + REPLAY.
    pub handshake_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            capability: Capability::Controller,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectConfig {
    pub fn viewer() -> Self {
        Self {
            capability: Capability::Viewer,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Something the broker told us after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Data(Vec<u8>),
    Exit(Option<i32>),
    /// The broker closed the socket without EXIT (e.g. we were displaced).
    Closed,
}

pub struct BrokerClient;

impl BrokerClient {
    /// Connect to the socket at `path` and complete the handshake.
    pub async fn connect(path: &Path, config: ConnectConfig) -> TetherResult<Attachment> {
        match time::timeout(config.handshake_timeout, Self::handshake(path, config.capability)).await {
            Ok(result) => result,
            Err(_) => Err(TetherError::Timeout("broker handshake")),
        }
    }

    async fn handshake(path: &Path, capability: Capability) -> TetherResult<Attachment> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| TetherError::Unreachable {
                path: path.to_path_buf(),
                source,
            })?;
        let (read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, &Frame::hello(capability)).await?;

        let mut reader = FrameReader::new(read_half);
        let welcome = match reader.read_frame().await? {
            Some(Frame::Welcome(welcome)) => welcome,
            Some(other) => {
                return Err(TetherError::Handshake(format!(
                    "expected WELCOME, got {:?}",
                    other.kind()
                )))
            }
            None => return Err(TetherError::Handshake("broker closed the connection".into())),
        };
        let replay = match reader.read_frame().await? {
            Some(Frame::Replay(bytes)) => bytes,
            Some(other) => {
                return Err(TetherError::Handshake(format!(
                    "expected REPLAY, got {:?}",
                    other.kind()
                )))
            }
            None => return Err(TetherError::Handshake("broker closed before REPLAY".into())),
        };
        debug!(
            session_id = %welcome.session_id,
            conn_id = welcome.connection_id,
            replay = replay.len(),
            %capability,
            "attached"
        );

        Ok(Attachment {
            socket_path: path.to_path_buf(),
            capability,
            welcome,
            replay,
            reader: AttachmentReader { inner: reader },
            writer: AttachmentWriter { inner: write_half },
        })
    }
}

/// An established connection.
pub struct Attachment {
    pub socket_path: PathBuf,
    pub capability: Capability,
    pub welcome: WelcomePayload,
    /// Output produced before we joined.
    pub replay: Vec<u8>,
    pub reader: AttachmentReader,
    pub writer: AttachmentWriter,
}

impl Attachment {
    pub fn split(self) -> (AttachmentReader, AttachmentWriter) {
        (self.reader, self.writer)
    }
}

pub struct AttachmentReader {
    inner: FrameReader<OwnedReadHalf>,
}

impl AttachmentReader {
    /// Next live event. Cancel-safe.
    pub async fn next_event(&mut self) -> TetherResult<SessionEvent> {
        loop {
            match self.inner.read_frame().await {
                Ok(Some(Frame::Data(bytes))) => return Ok(SessionEvent::Data(bytes)),
                Ok(Some(Frame::Exit(exit))) => return Ok(SessionEvent::Exit(exit.code)),
                Ok(Some(other)) => debug!(kind = ?other.kind(), "ignoring frame"),
                Ok(None) => return Ok(SessionEvent::Closed),
                Err(TetherError::Io(e)) if e.kind() == ErrorKind::ConnectionReset => {
                    return Ok(SessionEvent::Closed)
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct AttachmentWriter {
    inner: OwnedWriteHalf,
}

impl AttachmentWriter {
    pub async fn send_input(&mut self, data: &[u8]) -> TetherResult<()> {
        for chunk in data.chunks(tether_core::MAX_PAYLOAD) {
            write_frame(&mut self.inner, &Frame::Data(chunk.to_vec())).await?;
        }
        Ok(())
    }

    pub async fn resize(&mut self, rows: u16, cols: u16) -> TetherResult<()> {
        write_frame(&mut self.inner, &Frame::Resize(ResizePayload { rows, cols })).await
    }

    /// Privileged; the broker ignores it from viewers.
    pub async fn signal(&mut self, kind: SignalKind) -> TetherResult<()> {
        write_frame(&mut self.inner, &Frame::signal(kind)).await
    }

    /// Privileged; replaces the session's process.
    pub async fn spawn(&mut self, request: SpawnPayload) -> TetherResult<()> {
        write_frame(&mut self.inner, &Frame::Spawn(request)).await
    }

    /// Half-close our side. The broker finishes dispatching what we sent.
    pub async fn close(mut self) -> TetherResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

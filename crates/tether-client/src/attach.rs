//! Interactive attach loop: local input to the broker, broker output to the
//! local terminal, until detach, EXIT or disconnect.
//!
//! Terminal handling (raw mode, size changes) belongs to the caller. This
//! loop only sees byte chunks and `(rows, cols)` pairs.

use tether_core::{TetherError, TetherResult};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::client::{Attachment, SessionEvent};

/// Ctrl-]
pub const DEFAULT_DETACH_KEY: u8 = 0x1d;

/// Why the attach loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The local user pressed the detach key. The session keeps running.
    Detached,
    /// The session's process exited.
    Exited(Option<i32>),
    /// The broker dropped the connection, e.g. another controller took over.
    Closed,
}

/// Parse `ctrl-]`, `ctrl-a`, `^]` style key names into the byte they send.
pub fn parse_detach_key(spec: &str) -> TetherResult<u8> {
    let lower = spec.trim().to_ascii_lowercase();
    let key = lower
        .strip_prefix("ctrl-")
        .or_else(|| lower.strip_prefix("ctrl+"))
        .or_else(|| lower.strip_prefix('^'))
        .ok_or_else(|| TetherError::Other(format!("detach key must be a ctrl chord, got `{spec}`")))?;
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if ('@'..='_').contains(&c.to_ascii_uppercase()) => {
            Ok(c.to_ascii_uppercase() as u8 & 0x1f)
        }
        _ => Err(TetherError::Other(format!("unsupported detach key `{spec}`"))),
    }
}

/// Finds the detach byte in an input chunk.
#[derive(Debug, Clone, Copy)]
pub struct DetachDetector {
    key: u8,
}

impl DetachDetector {
    pub fn new(key: u8) -> Self {
        Self { key }
    }

    /// Bytes to forward, and whether the chunk asked to detach. Anything
    /// after the detach key is dropped.
    pub fn scan<'a>(&self, chunk: &'a [u8]) -> (&'a [u8], bool) {
        match chunk.iter().position(|&b| b == self.key) {
            Some(pos) => (&chunk[..pos], true),
            None => (chunk, false),
        }
    }
}

/// Pump an attachment until it ends.
///
/// The replay is written first. `input` closing (stdin EOF) stops forwarding
/// input but keeps streaming output.
pub async fn run<O>(
    attachment: Attachment,
    mut input: mpsc::Receiver<Vec<u8>>,
    mut resizes: mpsc::Receiver<(u16, u16)>,
    mut output: O,
    detach_key: u8,
) -> TetherResult<AttachOutcome>
where
    O: AsyncWrite + Unpin,
{
    let detector = DetachDetector::new(detach_key);
    let session_id = attachment.welcome.session_id.clone();
    output.write_all(&attachment.replay).await?;
    output.flush().await?;

    let (mut reader, mut writer) = attachment.split();
    let mut input_open = true;
    let mut resizes_open = true;

    loop {
        tokio::select! {
            event = reader.next_event() => match event? {
                SessionEvent::Data(bytes) => {
                    output.write_all(&bytes).await?;
                    output.flush().await?;
                }
                SessionEvent::Exit(code) => {
                    info!(%session_id, ?code, "session exited");
                    return Ok(AttachOutcome::Exited(code));
                }
                SessionEvent::Closed => {
                    info!(%session_id, "broker closed the connection");
                    return Ok(AttachOutcome::Closed);
                }
            },
            chunk = input.recv(), if input_open => match chunk {
                Some(chunk) => {
                    let (forward, detach) = detector.scan(&chunk);
                    if !forward.is_empty() {
                        writer.send_input(forward).await?;
                    }
                    if detach {
                        info!(%session_id, "detached");
                        writer.close().await.ok();
                        return Ok(AttachOutcome::Detached);
                    }
                }
                None => {
                    debug!("local input closed");
                    input_open = false;
                }
            },
            size = resizes.recv(), if resizes_open => match size {
                Some((rows, cols)) => writer.resize(rows, cols).await?,
                None => resizes_open = false,
            },
        }
    }
}

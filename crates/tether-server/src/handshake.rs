//! Connection handshake.
//!
//! 1. Client connects and sends HELLO (version + capability class)
//! 2. Broker validates the version and admits the connection
//! 3. Broker sends WELCOME, then one REPLAY, then live DATA
//!
//! Frames arriving before a valid HELLO are discarded unread.

use std::time::Duration;

use tether_core::frame::HelloPayload;
use tether_core::{Frame, FrameReader, FrameType, TetherError, TetherResult, PROTOCOL_VERSION};
use tokio::io::AsyncRead;
use tracing::debug;

/// Check a HELLO against the local protocol version.
pub fn check_hello(hello: &HelloPayload) -> TetherResult<()> {
    if !PROTOCOL_VERSION.is_compatible_with(&hello.version) {
        return Err(TetherError::VersionMismatch {
            local: PROTOCOL_VERSION.major,
            peer: hello.version.major,
        });
    }
    debug!(
        version = %hello.version,
        capability = %hello.capability,
        client = hello.client.as_deref().unwrap_or("-"),
        "received HELLO"
    );
    Ok(())
}

/// Read until a HELLO arrives or `limit` elapses.
pub async fn await_hello<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    limit: Duration,
) -> TetherResult<HelloPayload> {
    let hello = tokio::time::timeout(limit, read_hello(reader))
        .await
        .map_err(|_| TetherError::Timeout("HELLO"))??;
    check_hello(&hello)?;
    Ok(hello)
}

async fn read_hello<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> TetherResult<HelloPayload> {
    loop {
        let raw = reader
            .read_raw()
            .await?
            .ok_or_else(|| TetherError::Handshake("closed before HELLO".into()))?;
        if raw.kind != FrameType::Hello {
            debug!(kind = ?raw.kind, "discarding frame before handshake");
            continue;
        }
        return match Frame::decode(raw)? {
            Frame::Hello(hello) => Ok(hello),
            _ => Err(TetherError::Handshake("expected HELLO".into())),
        };
    }
}

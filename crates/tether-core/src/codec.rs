//! Length-delimited framing for the broker socket.
//!
//! Wire format: `[1-byte type][4-byte big-endian length][payload]`

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{TetherError, TetherResult};
use crate::frame::{Frame, FrameType, RawFrame};

pub const HEADER_LEN: usize = 5;

/// Hard cap on a single frame's payload.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Encode a tag and payload into a single wire frame.
pub fn encode_raw(kind: FrameType, payload: &[u8]) -> TetherResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(TetherError::FrameTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(kind.into());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encode a typed frame.
pub fn frame_encode(frame: &Frame) -> TetherResult<Vec<u8>> {
    encode_raw(frame.kind(), &frame.payload_bytes()?)
}

/// Streaming frame decoder: accumulates bytes and yields complete frames
/// regardless of how the input was split across reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes and return every frame completed by them.
    ///
    /// An unknown tag or an oversized length is reported as soon as the
    /// header is visible; the decoder is unusable for that stream afterwards.
    pub fn feed(&mut self, data: &[u8]) -> TetherResult<Vec<RawFrame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Pop one complete frame from the buffer, if present.
    pub fn next_frame(&mut self) -> TetherResult<Option<RawFrame>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let kind = FrameType::try_from(self.buffer[0])?;
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if len > MAX_PAYLOAD {
            return Err(TetherError::FrameTooLarge {
                len,
                max: MAX_PAYLOAD,
            });
        }
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buffer.drain(..HEADER_LEN + len);
        Ok(Some(RawFrame { kind, payload }))
    }

    /// Number of bytes buffered but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Reads frames off an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    buf: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; 16 * 1024].into_boxed_slice(),
        }
    }

    /// Next raw frame, or `None` on a clean end of stream.
    pub async fn read_raw(&mut self) -> TetherResult<Option<RawFrame>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.pending() > 0 {
                    return Err(TetherError::Codec(format!(
                        "stream ended inside a frame ({} bytes pending)",
                        self.decoder.pending()
                    )));
                }
                return Ok(None);
            }
            self.decoder.buffer.extend_from_slice(&self.buf[..n]);
        }
    }

    /// Next decoded frame, or `None` on a clean end of stream.
    pub async fn read_frame(&mut self) -> TetherResult<Option<Frame>> {
        match self.read_raw().await? {
            Some(raw) => Frame::decode(raw).map(Some),
            None => Ok(None),
        }
    }
}

/// Encode and write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> TetherResult<()> {
    let bytes = frame_encode(frame)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

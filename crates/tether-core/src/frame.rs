//! Frame types and typed payloads for the broker protocol.
//!
//! Structured payloads are CBOR maps. `DATA` and `REPLAY` carry raw
//! terminal bytes which are never interpreted.

use std::collections::HashMap;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::error::{TetherError, TetherResult};

/// Numeric frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Welcome = 0x02,
    Replay = 0x03,
    Data = 0x04,
    Resize = 0x05,
    Exit = 0x06,
    Signal = 0x07,
    Spawn = 0x08,
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = TetherError;
    fn try_from(v: u8) -> Result<Self, TetherError> {
        match v {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Welcome),
            0x03 => Ok(Self::Replay),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::Resize),
            0x06 => Ok(Self::Exit),
            0x07 => Ok(Self::Signal),
            0x08 => Ok(Self::Spawn),
            _ => Err(TetherError::UnknownFrameType(v)),
        }
    }
}

impl FrameType {
    /// Frames only a controller connection may act on.
    pub fn is_privileged(self) -> bool {
        matches!(self, FrameType::Signal | FrameType::Spawn)
    }
}

/// Protocol version carried in `HELLO`. Only the major number must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Capability class declared by a connection during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Controller,
    Viewer,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Controller => f.write_str("controller"),
            Capability::Viewer => f.write_str("viewer"),
        }
    }
}

/// Signals a controller may deliver to the session's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Interrupt,
    Terminate,
    Kill,
    Hangup,
}

impl std::str::FromStr for SignalKind {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interrupt" | "int" | "sigint" => Ok(SignalKind::Interrupt),
            "terminate" | "term" | "sigterm" => Ok(SignalKind::Terminate),
            "kill" | "sigkill" => Ok(SignalKind::Kill),
            "hangup" | "hup" | "sighup" => Ok(SignalKind::Hangup),
            other => Err(TetherError::Other(format!("unknown signal: {other}"))),
        }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: ProtocolVersion,
    pub capability: Capability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub session_id: String,
    pub scope_key: String,
    pub connection_id: u64,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizePayload {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPayload {
    #[serde(default)]
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub kind: SignalKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnPayload {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// A frame as it arrives off the wire: validated tag, undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: FrameType,
    pub payload: Vec<u8>,
}

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello(HelloPayload),
    Welcome(WelcomePayload),
    Replay(Vec<u8>),
    Data(Vec<u8>),
    Resize(ResizePayload),
    Exit(ExitPayload),
    Signal(SignalPayload),
    Spawn(SpawnPayload),
}

impl Frame {
    pub fn kind(&self) -> FrameType {
        match self {
            Frame::Hello(_) => FrameType::Hello,
            Frame::Welcome(_) => FrameType::Welcome,
            Frame::Replay(_) => FrameType::Replay,
            Frame::Data(_) => FrameType::Data,
            Frame::Resize(_) => FrameType::Resize,
            Frame::Exit(_) => FrameType::Exit,
            Frame::Signal(_) => FrameType::Signal,
            Frame::Spawn(_) => FrameType::Spawn,
        }
    }

    /// Serialize the payload portion of this frame (no header).
    pub fn payload_bytes(&self) -> TetherResult<Vec<u8>> {
        match self {
            Frame::Hello(p) => cbor_encode(p),
            Frame::Welcome(p) => cbor_encode(p),
            Frame::Replay(bytes) | Frame::Data(bytes) => Ok(bytes.clone()),
            Frame::Resize(p) => cbor_encode(p),
            Frame::Exit(p) => cbor_encode(p),
            Frame::Signal(p) => cbor_encode(p),
            Frame::Spawn(p) => cbor_encode(p),
        }
    }

    /// Decode a raw frame's payload according to its tag.
    pub fn decode(raw: RawFrame) -> TetherResult<Frame> {
        let RawFrame { kind, payload } = raw;
        Ok(match kind {
            FrameType::Hello => Frame::Hello(cbor_decode(&payload)?),
            FrameType::Welcome => Frame::Welcome(cbor_decode(&payload)?),
            FrameType::Replay => Frame::Replay(payload),
            FrameType::Data => Frame::Data(payload),
            FrameType::Resize => Frame::Resize(cbor_decode(&payload)?),
            FrameType::Exit => Frame::Exit(cbor_decode(&payload)?),
            FrameType::Signal => Frame::Signal(cbor_decode(&payload)?),
            FrameType::Spawn => Frame::Spawn(cbor_decode(&payload)?),
        })
    }

    pub fn hello(capability: Capability) -> Frame {
        Frame::Hello(HelloPayload {
            version: PROTOCOL_VERSION,
            capability,
            client: Some(format!("tether/{}", env!("CARGO_PKG_VERSION"))),
        })
    }

    pub fn resize(rows: u16, cols: u16) -> Frame {
        Frame::Resize(ResizePayload { rows, cols })
    }

    pub fn exit(code: Option<i32>) -> Frame {
        Frame::Exit(ExitPayload { code })
    }

    pub fn signal(kind: SignalKind) -> Frame {
        Frame::Signal(SignalPayload { kind })
    }
}

/// Encode a serializable value as a bare CBOR payload.
pub fn cbor_encode<T: Serialize>(value: &T) -> TetherResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a bare CBOR payload into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> TetherResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_tags_are_stable() {
        for tag in 0x01u8..=0x08 {
            let t = FrameType::try_from(tag).unwrap();
            assert_eq!(u8::from(t), tag);
        }
        assert!(matches!(
            FrameType::try_from(0x42),
            Err(TetherError::UnknownFrameType(0x42))
        ));
    }

    #[test]
    fn only_signal_and_spawn_are_privileged() {
        assert!(FrameType::Signal.is_privileged());
        assert!(FrameType::Spawn.is_privileged());
        assert!(!FrameType::Data.is_privileged());
        assert!(!FrameType::Resize.is_privileged());
    }

    #[test]
    fn hello_payload_decodes() {
        let frame = Frame::hello(Capability::Viewer);
        let raw = RawFrame {
            kind: frame.kind(),
            payload: frame.payload_bytes().unwrap(),
        };
        match Frame::decode(raw).unwrap() {
            Frame::Hello(h) => {
                assert_eq!(h.capability, Capability::Viewer);
                assert_eq!(h.version, PROTOCOL_VERSION);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn data_payload_is_opaque() {
        let bytes = vec![0x1b, b'[', b'2', b'J', 0xff, 0x00];
        let frame = Frame::Data(bytes.clone());
        assert_eq!(frame.payload_bytes().unwrap(), bytes);
    }

    #[test]
    fn garbage_hello_is_a_codec_error() {
        let raw = RawFrame {
            kind: FrameType::Hello,
            payload: vec![0xff, 0xfe, 0x00],
        };
        assert!(matches!(Frame::decode(raw), Err(TetherError::Codec(_))));
    }

    #[test]
    fn minor_versions_are_compatible() {
        let a = ProtocolVersion { major: 1, minor: 0 };
        let b = ProtocolVersion { major: 1, minor: 7 };
        let c = ProtocolVersion { major: 2, minor: 0 };
        assert!(a.is_compatible_with(&b));
        assert!(!a.is_compatible_with(&c));
    }

    #[test]
    fn signal_kind_parses_aliases() {
        assert_eq!("INT".parse::<SignalKind>().unwrap(), SignalKind::Interrupt);
        assert_eq!("sigterm".parse::<SignalKind>().unwrap(), SignalKind::Terminate);
        assert!("usr1".parse::<SignalKind>().is_err());
    }
}

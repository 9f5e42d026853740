//! tether-core: shared protocol library for tether session brokers.
//!
//! Provides the frame types and streaming codec spoken on a broker socket,
//! session/scope naming for the socket directory, and the session registry.

pub mod codec;
pub mod error;
pub mod frame;
pub mod naming;
pub mod registry;

// Re-export commonly used items at crate root.
pub use codec::{frame_encode, write_frame, FrameDecoder, FrameReader, MAX_PAYLOAD};
pub use error::{TetherError, TetherResult};
pub use frame::{
    Capability, Frame, FrameType, HelloPayload, ProtocolVersion, RawFrame, SignalKind,
    SpawnPayload, WelcomePayload, PROTOCOL_VERSION,
};
pub use registry::{FileRegistry, MemoryRegistry, RegistryEntry, SessionRegistry};

//! tether-client: connect to, create and clean up tether sessions.
//!
//! - `discovery` resolves a session to its broker socket
//! - `client` performs the handshake and streams frames
//! - `attach` runs the interactive pump with local detach
//! - `launcher` creates sessions and cleans up after failed creations
//! - `reaper` purges sockets and registry entries of dead brokers

pub mod attach;
pub mod client;
pub mod control;
pub mod discovery;
pub mod launcher;
pub mod probe;
pub mod reaper;

pub use attach::{AttachOutcome, DetachDetector, DEFAULT_DETACH_KEY};
pub use client::{Attachment, AttachmentReader, AttachmentWriter, BrokerClient, ConnectConfig, SessionEvent};
pub use control::{destroy_session, list_sessions, resize_session, signal_session, SessionStatus};
pub use discovery::resolve;
pub use launcher::{CreateRequest, LauncherConfig, SessionLauncher};
pub use probe::{probe, Liveness};
pub use reaper::{ReapReport, Reaper, ReaperConfig};

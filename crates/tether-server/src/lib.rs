//! tether-server: the per-session PTY broker.
//!
//! Owns one interactive process inside a pseudo-terminal and exposes it on a
//! Unix socket, where any number of viewers and at most one controller can
//! attach at the same time.

pub mod broker;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod server;
pub mod session;

pub use config::{BrokerConfig, CliOverrides};
pub use server::SessionServer;
pub use session::pty::ProcessSpec;

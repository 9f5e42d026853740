//! The process side of a session: the PTY child and its replay buffer.

pub mod pty;
pub mod ring_buffer;

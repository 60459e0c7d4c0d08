//! Shared vocabulary of the `tcpcore` engine.
//!
//! This crate carries the types exchanged between the connection engine and
//! its collaborators: the connection state enum, the decoded segment
//! descriptor handed across the wire seam, and the error codes surfaced by
//! the socket API.

mod error;
mod segment;
mod state;

pub use error::TcpError;
pub use segment::{Segment, SegmentFlags};
pub use state::TcpState;

use std::fmt::Display;
use std::net::SocketAddr;

/// The local/remote endpoint pair identifying one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl Quad {
    #[must_use]
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Quad { local, remote }
    }
}

impl Display for Quad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

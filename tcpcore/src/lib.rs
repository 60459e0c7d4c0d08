//! A blocking TCP connection engine.
//!
//! `tcpcore` implements the endpoint half of TCP: the 11-state connection
//! machine, the chunked transmit/receive side-buffers bridging user byte
//! streams and sequence-numbered segments, retransmission/override/2MSL
//! timers, the congestion variables, and the listener SYN queue behind
//! `accept`. It does not touch the wire: segments cross a narrow seam as
//! decoded descriptors ([`Segment`]), and the embedder supplies the encode/
//! transmit layer ([`SegmentTx`]), the source-address selection
//! ([`RouteProvider`]), a thread feeding [`TcpStack::segment_arrives`], and
//! a thread driving [`TcpStack::on_timer`].
//!
//! All user-facing calls on [`TcpSocket`] block with per-socket timeouts.
//! One stack-wide mutex serializes control-block mutation; a per-socket
//! level-triggered event bus is the only cross-thread wake channel.

mod buf;
mod cong;
mod config;
mod event;
mod input;
mod output;
mod port;
mod queue;
mod seq;
mod socket;
mod stack;
mod tcb;
mod timer;

pub use cong::CongestState;
pub use config::{
    StackConfig, TCP_DEFAULT_MSS, TCP_DEFAULT_SYN_QUEUE_SIZE, TCP_INITIAL_RTO,
    TCP_INITIAL_WINDOW, TCP_MAX_MSS, TCP_MAX_RX_BUFFER_SIZE, TCP_MAX_SYN_QUEUE_SIZE,
    TCP_MAX_TX_BUFFER_SIZE, TCP_OVERRIDE_TIMEOUT, TCP_TIME_WAIT_TIMEOUT,
};
pub use event::Events;
pub use socket::{SendFlags, Shutdown, TcpSocket};
pub use stack::{QueueTx, RouteProvider, SegmentTx, SocketId, StaticRoute, TcpStack, TxProbe};

pub use tcpcore_types::{Quad, Segment, SegmentFlags, TcpError, TcpState};

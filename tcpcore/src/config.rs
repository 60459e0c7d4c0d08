use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default sender MSS assumed until the peer advertises one (RFC 9293 3.7.1).
pub const TCP_DEFAULT_MSS: u16 = 536;
/// Upper bound on any negotiated MSS.
pub const TCP_MAX_MSS: u16 = 1430;
/// Initial congestion window, in segments (RFC 3390).
pub const TCP_INITIAL_WINDOW: u16 = 3;
/// Retransmission timeout before any backoff has been applied.
pub const TCP_INITIAL_RTO: Duration = Duration::from_millis(1000);
/// Ceiling for the backed-off retransmission timeout.
pub const TCP_MAX_RTO: Duration = Duration::from_secs(60);
/// Override timer forcing out sub-MSS data held back by Nagle
/// (RFC 1122 4.2.3.4).
pub const TCP_OVERRIDE_TIMEOUT: Duration = Duration::from_millis(500);
/// 2MSL dwell time in TIME_WAIT.
pub const TCP_TIME_WAIT_TIMEOUT: Duration = Duration::from_millis(4000);
/// Hard cap on a listener's SYN queue.
pub const TCP_MAX_SYN_QUEUE_SIZE: usize = 16;
/// SYN queue depth used when the backlog argument is smaller.
pub const TCP_DEFAULT_SYN_QUEUE_SIZE: usize = 4;
/// Largest receive side-buffer a control block may own.
pub const TCP_MAX_RX_BUFFER_SIZE: usize = 22880;
/// Largest transmit side-buffer a control block may own.
pub const TCP_MAX_TX_BUFFER_SIZE: usize = 22880;
/// Duplicate ACKs triggering a fast retransmission (RFC 5681).
pub const TCP_DUP_ACK_THRESHOLD: u32 = 3;

/// Stack-wide defaults, copied into each socket at creation.
///
/// The clock exists so tests can drive the retransmission, override and
/// TIME_WAIT timers deterministically; production stacks keep the default.
#[derive(Clone)]
pub struct StackConfig {
    /// Bound on every blocking socket operation.
    pub timeout: Duration,
    /// Transmit side-buffer capacity handed to new sockets.
    pub tx_buffer_size: usize,
    /// Receive side-buffer capacity handed to new sockets.
    pub rx_buffer_size: usize,
    /// Time source for all connection timers.
    pub clock: Arc<dyn Fn() -> Instant + Send + Sync>,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            timeout: Duration::from_secs(30),
            tx_buffer_size: 2860,
            rx_buffer_size: 2860,
            clock: Arc::new(Instant::now),
        }
    }
}

impl fmt::Debug for StackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackConfig")
            .field("timeout", &self.timeout)
            .field("tx_buffer_size", &self.tx_buffer_size)
            .field("rx_buffer_size", &self.rx_buffer_size)
            .finish_non_exhaustive()
    }
}

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tcpcore_types::{Quad, TcpError, TcpState};

use crate::buf::ChunkBuffer;
use crate::cong::CongestState;
use crate::config::{StackConfig, TCP_INITIAL_RTO, TCP_OVERRIDE_TIMEOUT, TCP_TIME_WAIT_TIMEOUT};
use crate::event::{EventBus, Events};
use crate::queue::SynQueue;
use crate::timer::TcpTimer;

pub(crate) const UNSPECIFIED: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// The transmission control block: every piece of state one connection owns.
///
/// A TCB is mutated only under the stack mutex; the embedded event bus is
/// the sole channel by which a mutation wakes a blocked user call.
pub(crate) struct Tcb {
    pub state: TcpState,
    pub local: SocketAddr,
    pub remote: SocketAddr,

    /// Initial send / receive sequence numbers.
    pub iss: u32,
    pub irs: u32,

    /// Oldest unacknowledged byte, next byte to send, and bytes buffered by
    /// the user but not yet on the wire.
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_user: usize,
    /// Peer's advertised receive window.
    pub snd_wnd: u16,

    /// Next expected byte, advertised window, bytes pending user read.
    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub rcv_user: usize,

    /// Sender / receiver maximum segment sizes.
    pub smss: u16,
    pub rmss: u16,

    // Congestion control
    pub cwnd: u16,
    pub ssthresh: u16,
    pub recover: u32,
    pub congest: CongestState,
    pub dup_acks: u32,

    // Timers
    pub rto: Duration,
    pub rtx_timer: TcpTimer,
    pub override_timer: TcpTimer,
    pub time_wait_timer: TcpTimer,

    pub tx: Option<ChunkBuffer>,
    pub rx: Option<ChunkBuffer>,

    /// Pending half-open connections (listeners only).
    pub syn_queue: SynQueue,
    pub syn_queue_size: usize,

    /// The user still holds the socket handle.
    pub owned: bool,
    /// The peer delivered a RST.
    pub reset: bool,

    pub events: Arc<EventBus>,

    /// Bound on this socket's blocking operations.
    pub timeout: Duration,
    pub tx_size: usize,
    pub rx_size: usize,
}

impl Tcb {
    /// A fresh control block in CLOSED with nothing allocated.
    pub fn new(cfg: &StackConfig) -> Self {
        Tcb {
            state: TcpState::Closed,
            local: UNSPECIFIED,
            remote: UNSPECIFIED,
            iss: 0,
            irs: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_user: 0,
            snd_wnd: 0,
            rcv_nxt: 0,
            rcv_wnd: 0,
            rcv_user: 0,
            smss: 0,
            rmss: 0,
            cwnd: 0,
            ssthresh: u16::MAX,
            recover: 0,
            congest: CongestState::Idle,
            dup_acks: 0,
            rto: TCP_INITIAL_RTO,
            rtx_timer: TcpTimer::stopped(TCP_INITIAL_RTO),
            override_timer: TcpTimer::stopped(TCP_OVERRIDE_TIMEOUT),
            time_wait_timer: TcpTimer::stopped(TCP_TIME_WAIT_TIMEOUT),
            tx: None,
            rx: None,
            syn_queue: SynQueue::new(),
            syn_queue_size: 0,
            owned: true,
            reset: false,
            events: Arc::new(EventBus::new()),
            timeout: cfg.timeout,
            tx_size: cfg.tx_buffer_size,
            rx_size: cfg.rx_buffer_size,
        }
    }

    /// Materializes both side-buffers. On failure neither is retained and
    /// the block stays usable in CLOSED.
    pub fn allocate_buffers(&mut self) -> Result<(), TcpError> {
        let tx = ChunkBuffer::alloc(self.tx_size)?;
        let rx = match ChunkBuffer::alloc(self.rx_size) {
            Ok(rx) => rx,
            Err(e) => return Err(e),
        };
        self.tx_size = tx.capacity();
        self.rx_size = rx.capacity();
        self.tx = Some(tx);
        self.rx = Some(rx);
        Ok(())
    }

    /// Releases buffers and transient state and parks the block in CLOSED.
    pub fn release(&mut self) {
        self.state = TcpState::Closed;
        self.tx = None;
        self.rx = None;
        self.syn_queue.clear();
        self.snd_user = 0;
        self.rcv_user = 0;
        self.rtx_timer.stop();
        self.override_timer.stop();
        self.time_wait_timer.stop();
        self.remote = UNSPECIFIED;
        self.update_events();
    }

    pub fn quad(&self) -> Quad {
        Quad::new(self.local, self.remote)
    }

    pub fn tx_buf(&mut self) -> &mut ChunkBuffer {
        self.tx.as_mut().expect("transmit buffer not allocated")
    }

    pub fn rx_buf(&mut self) -> &mut ChunkBuffer {
        self.rx.as_mut().expect("receive buffer not allocated")
    }

    /// Sequence-space bytes in flight, virtual SYN/FIN bytes included.
    pub fn flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Free transmit space: `tx_size - (snd_user + (snd_nxt - snd_una))`.
    pub fn tx_free(&self) -> usize {
        self.tx_size
            .saturating_sub(self.snd_user + self.flight() as usize)
    }

    /// Bytes the send window and congestion window jointly still permit.
    pub fn usable_window(&self) -> u32 {
        let wnd = u32::from(self.snd_wnd).min(u32::from(self.cwnd));
        wnd.saturating_sub(self.flight())
    }

    /// Receive-buffer space available for new segments.
    pub fn rx_free(&self) -> usize {
        self.rx_size.saturating_sub(self.rcv_user)
    }

    /// Whether our FIN (if any was sent) has been acknowledged.
    pub fn fin_acked(&self) -> bool {
        self.state.is_tx_closing() && self.snd_una == self.snd_nxt
    }

    /// Recomputes the level-triggered event bits from the current state.
    ///
    /// Called after every mutation of the block; waiters re-validate state
    /// after waking, so over-setting a bit in a terminal state is the
    /// mechanism by which blocked calls learn the connection died.
    pub fn update_events(&self) {
        use TcpState::*;

        let mut set = Events::empty();

        if self.state.is_synchronized() {
            set |= Events::CONNECTED;
        }
        if self.state == Closed {
            set |= Events::CLOSED;
        }

        match self.state {
            Established | CloseWait => {
                if self.tx_free() > 0 {
                    set |= Events::TX_READY;
                }
            }
            FinWait1 | FinWait2 | Closing | LastAck | TimeWait | Closed => {
                set |= Events::TX_READY;
            }
            _ => {}
        }

        if self.snd_user == 0 {
            set |= Events::TX_DONE;
            if self.flight() == 0 {
                set |= Events::TX_ACKED;
            }
        }
        if self.state == Closed {
            set |= Events::TX_DONE | Events::TX_ACKED;
        }

        if matches!(self.state, FinWait2 | CloseWait | TimeWait | Closed) {
            set |= Events::TX_SHUTDOWN;
        }

        if self.rcv_user > 0 || self.state.is_rx_closed() || self.state == Closed {
            set |= Events::RX_READY;
        }

        if !self.syn_queue.is_empty() {
            set |= Events::ACCEPT;
        }

        self.events.apply(set, Events::all() - set);
    }
}

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use fxhash::FxHashMap;
use tcpcore_types::{Quad, Segment, SegmentFlags, TcpError, TcpState};

use crate::config::{StackConfig, TCP_DEFAULT_MSS};
use crate::input;
use crate::output;
use crate::queue::SynItem;
use crate::socket::TcpSocket;
use crate::tcb::Tcb;

pub type SocketId = u32;

/// Source-address selection, provided by the IP layer.
pub trait RouteProvider: Send {
    /// Picks a local address able to reach `remote`, or `None` when no
    /// interface is configured for it.
    fn source_for(&mut self, remote: IpAddr) -> Option<IpAddr>;
}

/// Single-homed [`RouteProvider`]: every remote is reached from one address.
pub struct StaticRoute(pub IpAddr);

impl RouteProvider for StaticRoute {
    fn source_for(&mut self, _remote: IpAddr) -> Option<IpAddr> {
        Some(self.0)
    }
}

/// The wire seam: encoding, checksumming and transmission of one finished
/// segment descriptor.
pub trait SegmentTx: Send {
    fn transmit(&mut self, quad: Quad, seg: &Segment) -> Result<(), TcpError>;
}

/// Queue-backed [`SegmentTx`] for tests and in-process drivers; emitted
/// segments are observed through the paired [`TxProbe`].
pub struct QueueTx {
    queue: Arc<Mutex<VecDeque<(Quad, Segment)>>>,
}

impl QueueTx {
    #[must_use]
    pub fn new() -> (QueueTx, TxProbe) {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        (
            QueueTx {
                queue: queue.clone(),
            },
            TxProbe { queue },
        )
    }
}

impl SegmentTx for QueueTx {
    fn transmit(&mut self, quad: Quad, seg: &Segment) -> Result<(), TcpError> {
        self.queue.lock().unwrap().push_back((quad, seg.clone()));
        Ok(())
    }
}

/// Reading end of a [`QueueTx`].
#[derive(Clone)]
pub struct TxProbe {
    queue: Arc<Mutex<VecDeque<(Quad, Segment)>>>,
}

impl TxProbe {
    pub fn pop(&self) -> Option<(Quad, Segment)> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn drain(&self) -> Vec<(Quad, Segment)> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Polls for the next emitted segment, up to `timeout`.
    pub fn wait_pop(&self, timeout: std::time::Duration) -> Option<(Quad, Segment)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(out) = self.pop() {
                return Some(out);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

pub(crate) struct StackInner {
    pub sockets: FxHashMap<SocketId, Tcb>,
    pub routes: Box<dyn RouteProvider>,
    pub tx: Box<dyn SegmentTx>,
    pub next_id: SocketId,
}

impl StackInner {
    fn alloc_id(&mut self) -> SocketId {
        self.next_id += 1;
        self.next_id
    }
}

/// The engine: socket table, demultiplexer and timer entry points.
///
/// One mutex serializes every control-block mutation, whichever of the three
/// producer threads (user calls, segment arrivals, timer ticks) performs it.
/// Blocking user calls release it around their event waits.
pub struct TcpStack {
    inner: Mutex<StackInner>,
    cfg: StackConfig,
}

impl TcpStack {
    pub fn new(routes: Box<dyn RouteProvider>, tx: Box<dyn SegmentTx>) -> Arc<TcpStack> {
        Self::with_config(StackConfig::default(), routes, tx)
    }

    pub fn with_config(
        cfg: StackConfig,
        routes: Box<dyn RouteProvider>,
        tx: Box<dyn SegmentTx>,
    ) -> Arc<TcpStack> {
        Arc::new(TcpStack {
            inner: Mutex::new(StackInner {
                sockets: FxHashMap::default(),
                routes,
                tx,
                next_id: 0,
            }),
            cfg,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StackInner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn now(&self) -> Instant {
        (self.cfg.clock)()
    }

    pub(crate) fn config(&self) -> &StackConfig {
        &self.cfg
    }

    /// Opens a fresh stream socket in CLOSED.
    pub fn socket(self: &Arc<Self>) -> TcpSocket {
        let mut inner = self.lock();
        let id = inner.alloc_id();
        let tcb = Tcb::new(&self.cfg);
        tcb.update_events();
        inner.sockets.insert(id, tcb);
        drop(inner);
        tracing::debug!(id, "socket opened");
        TcpSocket::from_raw(self.clone(), id)
    }

    /// Inserts an externally built control block (the accept path allocates
    /// children outside the stack mutex).
    pub(crate) fn install(&self, inner: &mut StackInner, tcb: Tcb) -> SocketId {
        let id = inner.alloc_id();
        inner.sockets.insert(id, tcb);
        id
    }

    /// Entry point for the network receive thread: one decoded segment,
    /// already verified and stripped by the wire layer.
    pub fn segment_arrives(&self, ifid: u32, src: SocketAddr, dst: SocketAddr, seg: Segment) {
        let now = self.now();
        let mut inner = self.lock();
        let StackInner { sockets, tx, .. } = &mut *inner;

        if let Some(tcb) = sockets.values_mut().find(|t| {
            !matches!(t.state, TcpState::Closed | TcpState::Listen)
                && t.remote == src
                && local_matches(t.local, dst)
        }) {
            input::on_segment(tcb, tx.as_mut(), &seg, now);
            return;
        }

        if seg.flags.contains(SegmentFlags::SYN) && !seg.flags.contains(SegmentFlags::ACK) {
            if let Some(tcb) = sockets
                .values_mut()
                .find(|t| t.state == TcpState::Listen && local_matches(t.local, dst))
            {
                admit_syn(tcb, ifid, src, dst, &seg);
                return;
            }
        }

        // No connection, no listener: refuse, unless it is itself a reset.
        if !seg.flags.contains(SegmentFlags::RST) {
            tracing::trace!(%src, %dst, "no socket for segment, refusing");
            let _ = tx.transmit(Quad::new(dst, src), &rst_for(&seg));
        }
    }

    /// Entry point for the timer thread. Fires whatever retransmission,
    /// override, persist and 2MSL work has come due on the stack clock.
    pub fn on_timer(&self) {
        let now = self.now();
        let mut inner = self.lock();
        let StackInner { sockets, tx, .. } = &mut *inner;

        let mut reap = Vec::new();
        for (id, tcb) in sockets.iter_mut() {
            if tcb.state == TcpState::TimeWait && tcb.time_wait_timer.expired(now) {
                tracing::debug!(quad = %tcb.quad(), "2MSL expired");
                tcb.release();
                if !tcb.owned {
                    reap.push(*id);
                }
                continue;
            }

            if tcb.snd_user > 0 && tcb.override_timer.expired(now) {
                let _ = output::tcp_output(tcb, tx.as_mut(), true, now);
                tcb.update_events();
            }

            if tcb.rtx_timer.expired(now) {
                let _ = output::on_rtx_expired(tcb, tx.as_mut(), now);
                tcb.update_events();
            }
        }
        for id in reap {
            sockets.remove(&id);
        }
    }

    /// Reclaims the TIME_WAIT connection that entered the state earliest.
    ///
    /// Used when the socket table is full and an ephemeral entry must go.
    /// Returns whether a connection was sacrificed.
    pub fn kill_oldest_connection(&self) -> bool {
        let mut inner = self.lock();
        let oldest = inner
            .sockets
            .iter()
            .filter(|(_, t)| t.state == TcpState::TimeWait)
            .filter_map(|(id, t)| t.time_wait_timer.start_time().map(|at| (*id, at)))
            .min_by_key(|&(_, at)| at)
            .map(|(id, _)| id);

        let Some(id) = oldest else {
            return false;
        };
        let tcb = inner.sockets.get_mut(&id).expect("selected above");
        tracing::debug!(quad = %tcb.quad(), "reclaiming oldest TIME_WAIT connection");
        tcb.release();
        if !tcb.owned {
            inner.sockets.remove(&id);
        }
        true
    }

    /// Number of live control blocks; diagnostic.
    pub fn socket_count(&self) -> usize {
        self.lock().sockets.len()
    }
}

fn local_matches(local: SocketAddr, dst: SocketAddr) -> bool {
    local.port() == dst.port() && (local.ip().is_unspecified() || local.ip() == dst.ip())
}

fn rst_for(seg: &Segment) -> Segment {
    if seg.flags.contains(SegmentFlags::ACK) {
        Segment::rst(seg.ack)
    } else {
        Segment {
            flags: SegmentFlags::RST | SegmentFlags::ACK,
            seq: 0,
            ack: seg.seq.wrapping_add(seg.wire_len()),
            wnd: 0,
            mss: None,
            payload: Vec::new(),
        }
    }
}

fn admit_syn(tcb: &mut Tcb, ifid: u32, src: SocketAddr, dst: SocketAddr, seg: &Segment) {
    if tcb.syn_queue.contains(src) {
        // The peer repeated its SYN while the first one waits for accept.
        return;
    }

    let item = SynItem::new(
        ifid,
        src,
        dst.ip(),
        seg.seq,
        seg.mss.unwrap_or(TCP_DEFAULT_MSS),
    );
    if tcb.syn_queue.push(item, tcb.syn_queue_size) {
        tracing::debug!(%src, %dst, ifid, depth = tcb.syn_queue.len(), "SYN admitted");
        tcb.update_events();
    } else {
        tracing::debug!(%src, %dst, "SYN queue full, dropping");
    }
}

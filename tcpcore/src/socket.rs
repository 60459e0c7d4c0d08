use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use tcpcore_types::{SegmentFlags, TcpError, TcpState};

use crate::config::{
    TCP_DEFAULT_MSS, TCP_DEFAULT_SYN_QUEUE_SIZE, TCP_MAX_MSS, TCP_MAX_RX_BUFFER_SIZE,
    TCP_MAX_SYN_QUEUE_SIZE, TCP_MAX_TX_BUFFER_SIZE, TCP_OVERRIDE_TIMEOUT,
};
use crate::event::{EventBus, Events};
use crate::output;
use crate::port;
use crate::stack::{SocketId, StackInner, TcpStack};
use crate::tcb::Tcb;

bitflags! {
    /// Modifiers of a single `send` call.
    pub struct SendFlags: u8 {
        /// Bypass coalescing and emit queued bytes immediately.
        const NO_DELAY = 0b0000_0001;
        /// Block until every byte queued by this call is acknowledged.
        const WAIT_ACK = 0b0000_0010;
        /// Mark the final segment pushed and flush it out.
        const PUSH     = 0b0000_0100;
    }
}

/// Direction selector for [`TcpSocket::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Send,
    Receive,
    Both,
}

/// A blocking stream socket handle.
///
/// Every operation is bounded by the socket timeout and follows the same
/// discipline: mutate the control block under the stack mutex, then block on
/// the socket's event bus with the mutex released and re-validate after
/// waking.
///
/// Dropping the handle relinquishes ownership of the control block; a
/// connection that is still established keeps running until it closes or is
/// reset, so callers wanting an immediate teardown use [`abort`].
///
/// [`abort`]: TcpSocket::abort
pub struct TcpSocket {
    stack: Arc<TcpStack>,
    id: SocketId,
}

impl TcpSocket {
    pub(crate) fn from_raw(stack: Arc<TcpStack>, id: SocketId) -> Self {
        TcpSocket { stack, id }
    }

    fn wait_handles(&self) -> Result<(Arc<EventBus>, Duration), TcpError> {
        let mut inner = self.stack.lock();
        let tcb = inner
            .sockets
            .get_mut(&self.id)
            .ok_or(TcpError::InvalidSocket)?;
        Ok((tcb.events.clone(), tcb.timeout))
    }

    fn with_tcb<R>(&self, f: impl FnOnce(&mut Tcb) -> R) -> Result<R, TcpError> {
        let mut inner = self.stack.lock();
        let tcb = inner
            .sockets
            .get_mut(&self.id)
            .ok_or(TcpError::InvalidSocket)?;
        Ok(f(tcb))
    }

    pub fn state(&self) -> Result<TcpState, TcpError> {
        self.with_tcb(|tcb| tcb.state)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TcpError> {
        self.with_tcb(|tcb| tcb.local)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, TcpError> {
        self.with_tcb(|tcb| tcb.remote)
    }

    /// Bounds every subsequent blocking call on this socket.
    pub fn set_timeout(&self, timeout: Duration) -> Result<(), TcpError> {
        self.with_tcb(|tcb| tcb.timeout = timeout)
    }

    /// Binds the local identity. Legal while CLOSED only.
    pub fn bind(&self, local: SocketAddr) -> Result<(), TcpError> {
        self.with_tcb(|tcb| {
            if tcb.state != TcpState::Closed {
                return Err(TcpError::AlreadyConnected);
            }
            tcb.local = local;
            Ok(())
        })?
    }

    /// Sizes the transmit side-buffer. Legal while CLOSED only.
    pub fn set_tx_buffer_size(&self, size: usize) -> Result<(), TcpError> {
        self.with_tcb(|tcb| {
            if tcb.state != TcpState::Closed {
                return Err(TcpError::AlreadyConnected);
            }
            tcb.tx_size = size.clamp(1, TCP_MAX_TX_BUFFER_SIZE);
            Ok(())
        })?
    }

    /// Sizes the receive side-buffer. Legal while CLOSED only.
    pub fn set_rx_buffer_size(&self, size: usize) -> Result<(), TcpError> {
        self.with_tcb(|tcb| {
            if tcb.state != TcpState::Closed {
                return Err(TcpError::AlreadyConnected);
            }
            tcb.rx_size = size.clamp(1, TCP_MAX_RX_BUFFER_SIZE);
            Ok(())
        })?
    }

    /// Active open: send a SYN and block until the handshake resolves.
    ///
    /// Re-invoking while a handshake is already in flight just re-enters the
    /// timed wait, so a user retry observed mid-handshake is idempotent.
    pub fn connect(&self, remote: SocketAddr) -> Result<(), TcpError> {
        let now = self.stack.now();
        let mut inner = self.stack.lock();
        let StackInner {
            sockets,
            routes,
            tx,
            ..
        } = &mut *inner;
        let tcb = sockets
            .get_mut(&self.id)
            .ok_or(TcpError::InvalidSocket)?;

        if tcb.state == TcpState::Closed {
            let source = routes
                .source_for(remote.ip())
                .ok_or(TcpError::NotConfigured)?;
            let port = if tcb.local.port() != 0 {
                tcb.local.port()
            } else {
                port::next_ephemeral()
            };
            tcb.remote = remote;
            tcb.local = SocketAddr::new(source, port);
            tcb.reset = false;

            if let Err(e) = tcb.allocate_buffers() {
                tcb.release();
                return Err(e);
            }

            let iss = rand::random::<u32>();
            tcb.iss = iss;
            tcb.snd_una = iss;
            tcb.snd_nxt = iss;
            tcb.tx_buf().reset(iss.wrapping_add(1));
            tcb.rcv_wnd = tcb.rx_size.min(usize::from(u16::MAX)) as u16;
            tcb.rmss = tcb.rx_size.min(usize::from(TCP_MAX_MSS)) as u16;
            tcb.smss = TCP_DEFAULT_MSS.min(TCP_MAX_MSS);
            tcb.cong_init();

            if let Err(e) =
                output::send_segment(tcb, tx.as_mut(), SegmentFlags::SYN, iss, 0, true, now)
            {
                tcb.release();
                return Err(e);
            }
            tcb.state = TcpState::SynSent;
            tracing::info!(quad = %tcb.quad(), "active open (SYN_SENT)");
            tcb.update_events();
        }

        let bus = tcb.events.clone();
        let timeout = tcb.timeout;
        drop(inner);

        let got = bus.wait(Events::CONNECTED | Events::CLOSED, timeout);

        let mut inner = self.stack.lock();
        inner
            .sockets
            .get_mut(&self.id)
            .ok_or(TcpError::InvalidSocket)?;
        if got.contains(Events::CONNECTED) {
            Ok(())
        } else if got.contains(Events::CLOSED) {
            Err(TcpError::ConnectionFailed)
        } else {
            Err(TcpError::Timeout)
        }
    }

    /// Passive open: clamp the backlog and enter LISTEN.
    ///
    /// Re-invoking on a listener re-clamps the backlog; any other
    /// non-CLOSED state is rejected.
    pub fn listen(&self, backlog: usize) -> Result<(), TcpError> {
        self.with_tcb(|tcb| {
            if !matches!(tcb.state, TcpState::Closed | TcpState::Listen) {
                return Err(TcpError::AlreadyConnected);
            }
            if tcb.local.port() == 0 {
                let port = port::next_ephemeral();
                tcb.local.set_port(port);
            }
            tcb.syn_queue_size =
                backlog.clamp(TCP_DEFAULT_SYN_QUEUE_SIZE, TCP_MAX_SYN_QUEUE_SIZE);
            tcb.state = TcpState::Listen;
            tracing::info!(local = %tcb.local, backlog = tcb.syn_queue_size, "listening");
            tcb.update_events();
            Ok(())
        })?
    }

    /// Blocks for a pending SYN and derives the child connection.
    ///
    /// The stack mutex is released around child allocation; the listener is
    /// re-validated afterwards, and SYNs that queued up meanwhile are served
    /// by the following calls.
    pub fn accept(&self) -> Result<(SocketAddr, TcpSocket), TcpError> {
        loop {
            let mut inner = self.stack.lock();
            let tcb = inner
                .sockets
                .get_mut(&self.id)
                .ok_or(TcpError::InvalidSocket)?;
            if tcb.state != TcpState::Listen {
                return Err(TcpError::NotConnected);
            }

            let Some(item) = tcb.syn_queue.pop() else {
                let bus = tcb.events.clone();
                let timeout = tcb.timeout;
                drop(inner);
                if bus.wait(Events::ACCEPT, timeout).is_empty() {
                    return Err(TcpError::Timeout);
                }
                continue;
            };
            let listener_port = tcb.local.port();
            let (tx_size, rx_size, timeout) = (tcb.tx_size, tcb.rx_size, tcb.timeout);
            tcb.update_events();
            drop(inner);

            // Child allocation must not happen under the stack mutex.
            let mut child = Tcb::new(self.stack.config());
            child.tx_size = tx_size;
            child.rx_size = rx_size;
            child.timeout = timeout;
            if child.allocate_buffers().is_err() {
                tracing::warn!(peer = %item.src, "child allocation failed, dropping pending SYN");
                continue;
            }

            child.local = SocketAddr::new(item.dst_addr, listener_port);
            child.remote = item.src;
            child.smss = item.mss.min(TCP_MAX_MSS);
            child.rmss = child.rx_size.min(usize::from(TCP_MAX_MSS)) as u16;
            let iss = rand::random::<u32>();
            child.iss = iss;
            child.irs = item.isn;
            child.snd_una = iss;
            child.snd_nxt = iss;
            child.rcv_nxt = item.isn.wrapping_add(1);
            child.rcv_wnd = child.rx_size.min(usize::from(u16::MAX)) as u16;
            child.tx_buf().reset(iss.wrapping_add(1));
            let rcv_nxt = child.rcv_nxt;
            child.rx_buf().reset(rcv_nxt);
            child.cong_init();

            let now = self.stack.now();
            let mut inner = self.stack.lock();
            let listener = inner
                .sockets
                .get_mut(&self.id)
                .ok_or(TcpError::InvalidSocket)?;
            if listener.state != TcpState::Listen || listener.local.port() == 0 {
                return Err(TcpError::NotConnected);
            }

            if let Err(e) = output::send_segment(
                &mut child,
                inner.tx.as_mut(),
                SegmentFlags::SYN | SegmentFlags::ACK,
                iss,
                0,
                true,
                now,
            ) {
                tracing::warn!(peer = %child.remote, error = %e, "SYN|ACK emission failed, aborting child");
                continue;
            }
            child.state = TcpState::SynRcvd;
            child.update_events();
            let peer = child.remote;
            tracing::info!(quad = %child.quad(), "accepted connection (SYN_RCVD)");

            let id = self.stack.install(&mut inner, child);
            drop(inner);
            return Ok((peer, TcpSocket::from_raw(self.stack.clone(), id)));
        }
    }

    /// Queues `data` for transmission, blocking for buffer space.
    ///
    /// Returns the byte count queued (all of `data` unless an error cuts the
    /// loop short). With [`SendFlags::WAIT_ACK`] the call additionally
    /// blocks until everything queued has been acknowledged.
    pub fn send(&self, data: &[u8], flags: SendFlags) -> Result<usize, TcpError> {
        let mut written = 0;
        while written < data.len() {
            let (bus, timeout) = self.wait_handles()?;
            if !bus.wait(Events::TX_READY, timeout).contains(Events::TX_READY) {
                return Err(TcpError::Timeout);
            }

            let now = self.stack.now();
            let mut inner = self.stack.lock();
            let StackInner { sockets, tx, .. } = &mut *inner;
            let tcb = sockets
                .get_mut(&self.id)
                .ok_or(TcpError::InvalidSocket)?;

            match tcb.state {
                TcpState::Established | TcpState::CloseWait => {}
                TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait => return Err(TcpError::ConnectionClosing),
                TcpState::Closed => {
                    return Err(if tcb.reset {
                        TcpError::ConnectionReset
                    } else {
                        TcpError::NotConnected
                    });
                }
                TcpState::Listen | TcpState::SynSent | TcpState::SynRcvd => {
                    return Err(TcpError::NotConnected)
                }
            }

            let free = tcb.tx_free();
            if free == 0 {
                return Err(TcpError::Failure);
            }

            let n = free.min(data.len() - written);
            let seq = tcb.snd_nxt.wrapping_add(tcb.snd_user as u32);
            tcb.tx_buf().write(seq, &data[written..written + n]);
            if tcb.snd_user == 0 {
                tcb.override_timer.restart(now, TCP_OVERRIDE_TIMEOUT);
            }
            tcb.snd_user += n;
            written += n;

            let force = flags.contains(SendFlags::NO_DELAY)
                || (flags.contains(SendFlags::PUSH) && written == data.len());
            output::tcp_output(tcb, tx.as_mut(), force, now).map_err(|_| TcpError::Failure)?;
            tcb.update_events();
        }

        if flags.contains(SendFlags::WAIT_ACK) {
            let (bus, timeout) = self.wait_handles()?;
            if !bus.wait(Events::TX_ACKED, timeout).contains(Events::TX_ACKED) {
                return Err(TcpError::Timeout);
            }
            self.with_tcb(|tcb| {
                if matches!(tcb.state, TcpState::Established | TcpState::CloseWait) {
                    Ok(())
                } else {
                    Err(TcpError::NotConnected)
                }
            })??;
        }
        Ok(written)
    }

    /// Blocks until at least one byte (or end-of-stream) is available and
    /// drains what fits into `buf`.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, TcpError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let now = self.stack.now();
            let mut inner = self.stack.lock();
            let StackInner { sockets, tx, .. } = &mut *inner;
            let tcb = sockets
                .get_mut(&self.id)
                .ok_or(TcpError::InvalidSocket)?;

            if matches!(
                tcb.state,
                TcpState::Listen | TcpState::SynSent | TcpState::SynRcvd
            ) {
                return Err(TcpError::NotConnected);
            }

            if tcb.rcv_user > 0 {
                let want = buf.len().min(tcb.rcv_user);
                let n = tcb.rx_buf().read(&mut buf[..want]);
                tcb.rcv_user -= n;
                let old_wnd = tcb.rcv_wnd;
                tcb.rcv_wnd = tcb.rx_free().min(usize::from(u16::MAX)) as u16;
                if tcb.state.is_synchronized() && old_wnd < tcb.smss && tcb.rcv_wnd >= tcb.smss {
                    // The drain reopened a whole segment of window.
                    let _ = output::send_segment(
                        tcb,
                        tx.as_mut(),
                        SegmentFlags::ACK,
                        tcb.snd_nxt,
                        0,
                        false,
                        now,
                    );
                }
                tcb.update_events();
                return Ok(n);
            }

            if tcb.reset {
                return Err(TcpError::ConnectionReset);
            }
            if tcb.state == TcpState::Closed {
                return Err(TcpError::NotConnected);
            }
            if tcb.state.is_rx_closed() {
                return Err(TcpError::EndOfStream);
            }

            let bus = tcb.events.clone();
            let timeout = tcb.timeout;
            drop(inner);
            if bus.wait(Events::RX_READY, timeout).is_empty() {
                return Err(TcpError::Timeout);
            }
        }
    }

    /// Half-closes the connection.
    pub fn shutdown(&self, how: Shutdown) -> Result<(), TcpError> {
        match how {
            Shutdown::Send => self.shutdown_send(),
            Shutdown::Receive => self.shutdown_receive(),
            Shutdown::Both => {
                self.shutdown_send()?;
                self.shutdown_receive()
            }
        }
    }

    fn shutdown_send(&self) -> Result<(), TcpError> {
        let needs_fin = self.with_tcb(|tcb| match tcb.state {
            TcpState::SynRcvd | TcpState::Established | TcpState::CloseWait => Ok(true),
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait => Ok(false),
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                Err(TcpError::NotConnected)
            }
        })??;

        if needs_fin {
            self.flush_tx()?;

            let now = self.stack.now();
            let mut inner = self.stack.lock();
            let StackInner { sockets, tx, .. } = &mut *inner;
            let tcb = sockets
                .get_mut(&self.id)
                .ok_or(TcpError::InvalidSocket)?;
            match tcb.state {
                TcpState::SynRcvd | TcpState::Established => {
                    output::send_fin(tcb, tx.as_mut(), now).map_err(|_| TcpError::Failure)?;
                    tcb.state = TcpState::FinWait1;
                    tracing::info!(quad = %tcb.quad(), "send side closed (FIN_WAIT_1)");
                    tcb.update_events();
                }
                TcpState::CloseWait => {
                    output::send_fin(tcb, tx.as_mut(), now).map_err(|_| TcpError::Failure)?;
                    tcb.state = TcpState::LastAck;
                    tracing::info!(quad = %tcb.quad(), "send side closed (LAST_ACK)");
                    tcb.update_events();
                }
                TcpState::Closed => {
                    return Err(if tcb.reset {
                        TcpError::ConnectionReset
                    } else {
                        TcpError::NotConnected
                    });
                }
                // A concurrent shutdown or incoming FIN moved us on; the
                // shutdown wait below still applies.
                _ => {}
            }
        }

        let (bus, timeout) = self.wait_handles()?;
        if !bus
            .wait(Events::TX_SHUTDOWN, timeout)
            .contains(Events::TX_SHUTDOWN)
        {
            return Err(TcpError::Timeout);
        }
        Ok(())
    }

    fn shutdown_receive(&self) -> Result<(), TcpError> {
        self.with_tcb(|tcb| match tcb.state {
            TcpState::Closed | TcpState::Listen => Err(TcpError::NotConnected),
            _ => Ok(()),
        })??;

        let (bus, timeout) = self.wait_handles()?;
        if !bus
            .wait(Events::TX_SHUTDOWN, timeout)
            .contains(Events::TX_SHUTDOWN)
        {
            return Err(TcpError::Timeout);
        }
        Ok(())
    }

    /// Forces buffered bytes onto the wire and waits for the buffer to run
    /// dry.
    fn flush_tx(&self) -> Result<(), TcpError> {
        let now = self.stack.now();
        {
            let mut inner = self.stack.lock();
            let StackInner { sockets, tx, .. } = &mut *inner;
            let tcb = sockets
                .get_mut(&self.id)
                .ok_or(TcpError::InvalidSocket)?;
            if tcb.snd_user > 0 {
                output::tcp_output(tcb, tx.as_mut(), true, now).map_err(|_| TcpError::Failure)?;
                tcb.update_events();
            }
        }

        let (bus, timeout) = self.wait_handles()?;
        if !bus.wait(Events::TX_DONE, timeout).contains(Events::TX_DONE) {
            return Err(TcpError::Timeout);
        }
        Ok(())
    }

    /// Tears the connection down immediately.
    ///
    /// Connected and intermediate states emit a RST at `snd_nxt` and the
    /// control block is deleted. TIME_WAIT only relinquishes ownership (the
    /// 2MSL timer reaps the block); every other state closes without a RST.
    /// The handle is consumed either way.
    pub fn abort(self) -> Result<(), TcpError> {
        let now = self.stack.now();
        let mut inner = self.stack.lock();
        let StackInner { sockets, tx, .. } = &mut *inner;
        let tcb = sockets
            .get_mut(&self.id)
            .ok_or(TcpError::InvalidSocket)?;

        match tcb.state {
            TcpState::SynRcvd
            | TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait => {
                let _ = output::send_segment(
                    tcb,
                    tx.as_mut(),
                    SegmentFlags::RST,
                    tcb.snd_nxt,
                    0,
                    false,
                    now,
                );
                tracing::info!(quad = %tcb.quad(), "connection aborted (RST)");
                tcb.release();
                sockets.remove(&self.id);
            }
            TcpState::TimeWait => {
                tcb.owned = false;
            }
            _ => {
                tcb.release();
                sockets.remove(&self.id);
            }
        }
        Ok(())
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        let mut inner = self.stack.lock();
        if let Some(tcb) = inner.sockets.get_mut(&self.id) {
            tcb.owned = false;
            if matches!(
                tcb.state,
                TcpState::Closed | TcpState::Listen | TcpState::SynSent
            ) {
                inner.sockets.remove(&self.id);
                tracing::debug!(id = self.id, "socket dropped, control block reclaimed");
            }
        }
    }
}

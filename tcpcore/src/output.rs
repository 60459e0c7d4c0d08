//! Segment emission: building descriptors out of the control block, the
//! Nagle-gated data pump behind `send`, and retransmission.

use std::time::Instant;

use tcpcore_types::{Segment, SegmentFlags, TcpError, TcpState};

use crate::config::TCP_MAX_RTO;
use crate::seq;
use crate::stack::SegmentTx;
use crate::tcb::Tcb;

/// Emits one segment for `tcb` through the wire-side collaborator.
///
/// `len` payload bytes are lifted out of the transmit buffer at `seq_no`.
/// `snd_nxt` advances past any newly covered sequence space (virtual SYN and
/// FIN bytes included); `retransmit` arms the retransmission timer if it is
/// not already running.
pub(crate) fn send_segment(
    tcb: &mut Tcb,
    tx: &mut dyn SegmentTx,
    flags: SegmentFlags,
    seq_no: u32,
    len: usize,
    retransmit: bool,
    now: Instant,
) -> Result<(), TcpError> {
    let mut payload = vec![0u8; len];
    if len > 0 {
        let got = tcb.tx_buf().peek(seq_no, &mut payload);
        payload.truncate(got);
    }

    let seg = Segment {
        flags,
        seq: seq_no,
        ack: if flags.contains(SegmentFlags::ACK) {
            tcb.rcv_nxt
        } else {
            0
        },
        wnd: tcb.rcv_wnd,
        mss: if flags.contains(SegmentFlags::SYN) {
            Some(tcb.rmss)
        } else {
            None
        },
        payload,
    };

    tracing::trace!(
        quad = %tcb.quad(),
        flags = %seg.flags,
        seq = seg.seq,
        ack = seg.ack,
        len = seg.payload.len(),
        "segment out"
    );

    let end = seq_no.wrapping_add(seg.wire_len());
    tx.transmit(tcb.quad(), &seg)?;

    if seq::lt(tcb.snd_nxt, end) {
        tcb.snd_nxt = end;
    }
    if retransmit && !tcb.rtx_timer.running() {
        tcb.rtx_timer.restart(now, tcb.rto);
    }
    Ok(())
}

/// Drains user bytes from the transmit buffer onto the wire.
///
/// This is the coalescing decision point: a sub-MSS trailer is held back
/// while earlier data is unacknowledged, unless `force` is set (NO_DELAY,
/// PUSH, a shutdown flush) or the override timer has run out.
pub(crate) fn tcp_output(
    tcb: &mut Tcb,
    tx: &mut dyn SegmentTx,
    force: bool,
    now: Instant,
) -> Result<(), TcpError> {
    while tcb.snd_user > 0 {
        let usable = tcb.usable_window() as usize;
        let n = tcb.snd_user.min(usize::from(tcb.smss)).min(usable);
        if n == 0 {
            // Window shut: make sure the probe path has a timer to run on.
            if tcb.flight() == 0 && !tcb.rtx_timer.running() {
                tcb.rtx_timer.restart(now, tcb.rto);
            }
            break;
        }
        if n < usize::from(tcb.smss)
            && tcb.flight() > 0
            && !force
            && !tcb.override_timer.expired(now)
        {
            break;
        }

        let mut flags = SegmentFlags::ACK;
        if n == tcb.snd_user {
            flags |= SegmentFlags::PSH;
        }
        send_segment(tcb, tx, flags, tcb.snd_nxt, n, true, now)?;
        tcb.snd_user -= n;
    }

    if tcb.snd_user == 0 {
        tcb.override_timer.stop();
    }
    Ok(())
}

/// Emits our FIN at `snd_nxt`, consuming one sequence number.
pub(crate) fn send_fin(
    tcb: &mut Tcb,
    tx: &mut dyn SegmentTx,
    now: Instant,
) -> Result<(), TcpError> {
    send_segment(
        tcb,
        tx,
        SegmentFlags::FIN | SegmentFlags::ACK,
        tcb.snd_nxt,
        0,
        true,
        now,
    )
}

/// Resends the head of the send window (RTO expiry or fast retransmit).
pub(crate) fn retransmit_head(
    tcb: &mut Tcb,
    tx: &mut dyn SegmentTx,
    now: Instant,
) -> Result<(), TcpError> {
    match tcb.state {
        TcpState::SynSent => {
            return send_segment(tcb, tx, SegmentFlags::SYN, tcb.iss, 0, true, now);
        }
        TcpState::SynRcvd => {
            return send_segment(
                tcb,
                tx,
                SegmentFlags::SYN | SegmentFlags::ACK,
                tcb.iss,
                0,
                true,
                now,
            );
        }
        _ => {}
    }

    let buffered_end = tcb.tx_buf().end_seq();
    let resend_from = if seq::lt(tcb.snd_una, tcb.tx_buf().start_seq()) {
        tcb.tx_buf().start_seq()
    } else {
        tcb.snd_una
    };
    let data_avail = buffered_end.wrapping_sub(resend_from) as usize;

    if data_avail == 0 {
        if tcb.state.is_tx_closing() && !tcb.fin_acked() {
            return send_segment(
                tcb,
                tx,
                SegmentFlags::FIN | SegmentFlags::ACK,
                tcb.snd_nxt.wrapping_sub(1),
                0,
                true,
                now,
            );
        }
        return Ok(());
    }

    let n = data_avail.min(usize::from(tcb.smss));
    send_segment(tcb, tx, SegmentFlags::ACK, resend_from, n, true, now)
}

/// Retransmission-timer expiry: congestion collapse, head resend (or a
/// one-byte probe against a zero window), and exponential backoff.
pub(crate) fn on_rtx_expired(
    tcb: &mut Tcb,
    tx: &mut dyn SegmentTx,
    now: Instant,
) -> Result<(), TcpError> {
    if tcb.flight() == 0 && tcb.snd_user == 0 {
        tcb.rtx_timer.stop();
        return Ok(());
    }

    if tcb.snd_wnd == 0 && tcb.flight() == 0 && tcb.snd_user > 0 {
        // Zero-window probe: push a single byte past the window edge.
        tracing::debug!(quad = %tcb.quad(), "window probe");
        send_segment(tcb, tx, SegmentFlags::ACK, tcb.snd_nxt, 1, false, now)?;
        tcb.snd_user -= 1;
    } else {
        tracing::debug!(quad = %tcb.quad(), rto = ?tcb.rto, "retransmission timeout");
        if tcb.state.is_synchronized() {
            tcb.cong_on_rto();
        }
        retransmit_head(tcb, tx, now)?;
    }

    tcb.rto = (tcb.rto * 2).min(TCP_MAX_RTO);
    tcb.rtx_timer.restart(now, tcb.rto);
    Ok(())
}

//! The segment-driven half of the state machine.
//!
//! `on_segment` runs on the network receive thread under the stack mutex,
//! already demultiplexed to one connection. Wire decode, checksums and
//! out-of-order reassembly happen before this seam; anything not yet in
//! order is acknowledged away and resent by the peer.

use std::time::Instant;

use tcpcore_types::{Segment, SegmentFlags, TcpError, TcpState};

use crate::config::{TCP_INITIAL_RTO, TCP_MAX_MSS, TCP_TIME_WAIT_TIMEOUT};
use crate::output::{retransmit_head, send_segment, tcp_output};
use crate::seq;
use crate::stack::SegmentTx;
use crate::tcb::Tcb;

/// Applies one received segment to `tcb`.
///
/// Emission failures are transient here: the peer retransmits whatever a
/// dropped reply would have acknowledged.
pub(crate) fn on_segment(tcb: &mut Tcb, tx: &mut dyn SegmentTx, seg: &Segment, now: Instant) {
    if let Err(e) = process(tcb, tx, seg, now) {
        tracing::warn!(quad = %tcb.quad(), error = %e, "segment processing emission failed");
    }
    tcb.update_events();
}

fn process(
    tcb: &mut Tcb,
    tx: &mut dyn SegmentTx,
    seg: &Segment,
    now: Instant,
) -> Result<(), TcpError> {
    if seg.flags.contains(SegmentFlags::RST) {
        return on_rst(tcb, seg);
    }

    match tcb.state {
        TcpState::Closed | TcpState::Listen => Ok(()),
        TcpState::SynSent => on_syn_sent(tcb, tx, seg, now),
        _ => on_synchronized(tcb, tx, seg, now),
    }
}

fn on_rst(tcb: &mut Tcb, seg: &Segment) -> Result<(), TcpError> {
    let valid = match tcb.state {
        // A RST answering our SYN is checked against the ACK field.
        TcpState::SynSent => {
            !seg.flags.contains(SegmentFlags::ACK) || seg.ack == tcb.snd_nxt
        }
        TcpState::Closed | TcpState::Listen => false,
        _ => acceptable(tcb, seg),
    };
    if !valid {
        return Ok(());
    }

    tracing::debug!(quad = %tcb.quad(), state = ?tcb.state, "connection reset by peer");
    tcb.reset = true;
    tcb.state = TcpState::Closed;
    tcb.snd_user = 0;
    tcb.rcv_user = 0;
    tcb.rtx_timer.stop();
    tcb.override_timer.stop();
    tcb.time_wait_timer.stop();
    Ok(())
}

fn on_syn_sent(
    tcb: &mut Tcb,
    tx: &mut dyn SegmentTx,
    seg: &Segment,
    now: Instant,
) -> Result<(), TcpError> {
    if !seg.flags.contains(SegmentFlags::SYN) {
        return Ok(());
    }

    if seg.flags.contains(SegmentFlags::ACK) {
        // SYN|ACK completing our active open.
        if !(seq::gt(seg.ack, tcb.snd_una) && seq::le(seg.ack, tcb.snd_nxt)) {
            return Ok(());
        }
        take_remote_syn(tcb, seg);
        tcb.snd_una = seg.ack;
        tcb.rtx_timer.stop();
        tcb.rto = TCP_INITIAL_RTO;
        tcb.state = TcpState::Established;
        tracing::info!(quad = %tcb.quad(), "connection established (active open)");
        send_segment(tcb, tx, SegmentFlags::ACK, tcb.snd_nxt, 0, false, now)
    } else {
        // Simultaneous open: both SYNs crossed.
        take_remote_syn(tcb, seg);
        tcb.state = TcpState::SynRcvd;
        tracing::debug!(quad = %tcb.quad(), "simultaneous open");
        send_segment(
            tcb,
            tx,
            SegmentFlags::SYN | SegmentFlags::ACK,
            tcb.iss,
            0,
            true,
            now,
        )
    }
}

fn take_remote_syn(tcb: &mut Tcb, seg: &Segment) {
    tcb.irs = seg.seq;
    tcb.rcv_nxt = seg.seq.wrapping_add(1);
    let rcv_nxt = tcb.rcv_nxt;
    tcb.rx_buf().reset(rcv_nxt);
    tcb.snd_wnd = seg.wnd;
    if let Some(mss) = seg.mss {
        tcb.smss = tcb.smss.min(mss).min(TCP_MAX_MSS);
    }
}

/// In-window test for a segment against the receive window (RFC 9293 3.4).
fn acceptable(tcb: &Tcb, seg: &Segment) -> bool {
    let slen = seg.wire_len();
    let wend = tcb.rcv_nxt.wrapping_add(u32::from(tcb.rcv_wnd));
    let wstart = tcb.rcv_nxt.wrapping_sub(1);
    if slen == 0 {
        if tcb.rcv_wnd == 0 {
            seg.seq == tcb.rcv_nxt
        } else {
            seq::between(wstart, seg.seq, wend)
        }
    } else if tcb.rcv_wnd == 0 {
        false
    } else {
        seq::between(wstart, seg.seq, wend)
            || seq::between(wstart, seg.seq.wrapping_add(slen - 1), wend)
    }
}

fn on_synchronized(
    tcb: &mut Tcb,
    tx: &mut dyn SegmentTx,
    seg: &Segment,
    now: Instant,
) -> Result<(), TcpError> {
    if !acceptable(tcb, seg) {
        tracing::trace!(quad = %tcb.quad(), seq = seg.seq, "segment outside window");
        return send_segment(tcb, tx, SegmentFlags::ACK, tcb.snd_nxt, 0, false, now);
    }

    // Our SYN|ACK was lost; the peer repeats its SYN.
    if tcb.state == TcpState::SynRcvd
        && seg.flags.contains(SegmentFlags::SYN)
        && !seg.flags.contains(SegmentFlags::ACK)
    {
        return send_segment(
            tcb,
            tx,
            SegmentFlags::SYN | SegmentFlags::ACK,
            tcb.iss,
            0,
            false,
            now,
        );
    }

    if !seg.flags.contains(SegmentFlags::ACK) {
        return Ok(());
    }
    let ackn = seg.ack;

    if tcb.state == TcpState::SynRcvd {
        if seq::gt(ackn, tcb.snd_una) && seq::le(ackn, tcb.snd_nxt) {
            tcb.snd_una = ackn;
            tcb.snd_wnd = seg.wnd;
            tcb.rtx_timer.stop();
            tcb.rto = TCP_INITIAL_RTO;
            tcb.state = TcpState::Established;
            tracing::info!(quad = %tcb.quad(), "connection established (passive open)");
        }
    } else if seq::gt(ackn, tcb.snd_una) && seq::le(ackn, tcb.snd_nxt) {
        let acked = ackn.wrapping_sub(tcb.snd_una);
        tcb.snd_una = ackn;
        tcb.tx_buf().free_to(ackn);
        tcb.snd_wnd = seg.wnd;
        tcb.cong_on_ack(acked);
        tcb.rto = TCP_INITIAL_RTO;
        if tcb.flight() == 0 && tcb.snd_user == 0 {
            tcb.rtx_timer.stop();
        } else {
            tcb.rtx_timer.restart(now, tcb.rto);
        }
        tracing::trace!(quad = %tcb.quad(), acked, "acknowledged");
        tcp_output(tcb, tx, false, now)?;
    } else if ackn == tcb.snd_una {
        tcb.snd_wnd = seg.wnd;
        if seg.payload.is_empty() && tcb.flight() > 0 {
            if tcb.cong_on_dup_ack() {
                tracing::debug!(quad = %tcb.quad(), "fast retransmit");
                retransmit_head(tcb, tx, now)?;
            }
        }
        tcp_output(tcb, tx, false, now)?;
    }

    if tcb.fin_acked() {
        match tcb.state {
            TcpState::FinWait1 => {
                tracing::debug!(quad = %tcb.quad(), "our FIN acknowledged");
                tcb.state = TcpState::FinWait2;
            }
            TcpState::Closing => {
                tcb.state = TcpState::TimeWait;
                tcb.time_wait_timer.restart(now, TCP_TIME_WAIT_TIMEOUT);
            }
            TcpState::LastAck => {
                tracing::debug!(quad = %tcb.quad(), "close completed");
                tcb.state = TcpState::Closed;
                tcb.rtx_timer.stop();
                tcb.override_timer.stop();
            }
            _ => {}
        }
    }

    if !seg.payload.is_empty()
        && matches!(
            tcb.state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    {
        accept_data(tcb, tx, seg, now)?;
    }

    if seg.flags.contains(SegmentFlags::FIN) {
        on_fin(tcb, tx, seg, now)?;
    }

    Ok(())
}

fn accept_data(
    tcb: &mut Tcb,
    tx: &mut dyn SegmentTx,
    seg: &Segment,
    now: Instant,
) -> Result<(), TcpError> {
    let end = seg.seq.wrapping_add(seg.payload.len() as u32);
    if seq::le(end, tcb.rcv_nxt) || seq::gt(seg.seq, tcb.rcv_nxt) {
        // Full duplicate, or a segment past a hole the reassembly layer has
        // not filled: tell the peer where we stand.
        return send_segment(tcb, tx, SegmentFlags::ACK, tcb.snd_nxt, 0, false, now);
    }

    tcb.rx_buf().write(seg.seq, &seg.payload);
    let new_end = tcb.rx_buf().end_seq();
    let advance = new_end.wrapping_sub(tcb.rcv_nxt);
    if advance > 0 {
        tcb.rcv_nxt = new_end;
        tcb.rcv_user += advance as usize;
        tcb.rcv_wnd = tcb.rx_free().min(usize::from(u16::MAX)) as u16;
        tracing::trace!(quad = %tcb.quad(), bytes = advance, "data accepted");
    }
    send_segment(tcb, tx, SegmentFlags::ACK, tcb.snd_nxt, 0, false, now)
}

fn on_fin(
    tcb: &mut Tcb,
    tx: &mut dyn SegmentTx,
    seg: &Segment,
    now: Instant,
) -> Result<(), TcpError> {
    let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);

    if seq::lt(fin_seq, tcb.rcv_nxt) {
        // Retransmitted FIN we already consumed.
        if tcb.state == TcpState::TimeWait {
            tcb.time_wait_timer.restart(now, TCP_TIME_WAIT_TIMEOUT);
        }
        return send_segment(tcb, tx, SegmentFlags::ACK, tcb.snd_nxt, 0, false, now);
    }
    if fin_seq != tcb.rcv_nxt {
        // FIN beyond data we have not seen; the data path already asked for
        // a resend.
        return Ok(());
    }

    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
    match tcb.state {
        TcpState::SynRcvd | TcpState::Established => {
            tracing::info!(quad = %tcb.quad(), "peer closed its half (CLOSE_WAIT)");
            tcb.state = TcpState::CloseWait;
        }
        TcpState::FinWait1 => {
            // Our FIN is still unacknowledged: simultaneous close.
            tracing::info!(quad = %tcb.quad(), "simultaneous close (CLOSING)");
            tcb.state = TcpState::Closing;
        }
        TcpState::FinWait2 => {
            tracing::info!(quad = %tcb.quad(), "close completed (TIME_WAIT)");
            tcb.state = TcpState::TimeWait;
            tcb.time_wait_timer.restart(now, TCP_TIME_WAIT_TIMEOUT);
        }
        _ => {}
    }
    send_segment(tcb, tx, SegmentFlags::ACK, tcb.snd_nxt, 0, false, now)
}

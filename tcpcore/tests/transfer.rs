//! Data transfer: the send pump, window and buffer bounds, coalescing,
//! retransmission, receive delivery and stream termination.

mod common;

use std::thread;
use std::time::Duration;

use common::*;
use tcpcore::{SendFlags, TcpError, TcpState};

#[test]
fn send_and_receive_roundtrip() {
    let (stack, probe, _clock) = stack();
    let sock = stack.socket();
    let mut peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    let n = sock.send(b"hello world", SendFlags::empty()).unwrap();
    assert_eq!(n, 11);

    let (_, seg) = probe.pop().expect("no data segment");
    assert_eq!(seg.payload, b"hello world");
    assert_eq!(seg.seq, peer.ack);
    peer.ack_upto(seg.seq.wrapping_add(11));

    peer.send_data(b"general kenobi");
    let mut buf = [0u8; 64];
    let n = sock.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"general kenobi");

    // Delivery was acknowledged.
    let (_, ack) = probe.pop().expect("no delivery ACK");
    assert_eq!(ack.ack, peer.seq);

    let _ = sock.abort();
}

#[test]
fn receive_blocks_until_data_arrives() {
    let (stack, probe, _clock) = stack();
    let sock = stack.socket();
    let peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    let (seq, ack, local, remote) = (peer.seq, peer.ack, peer.local, peer.remote);
    let stack2 = stack.clone();
    let driver = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stack2.segment_arrives(
            0,
            remote,
            local,
            tcpcore::Segment::data(seq, ack, PEER_WND, b"late".to_vec()),
        );
    });

    let mut buf = [0u8; 16];
    let n = sock.receive(&mut buf).unwrap();
    driver.join().unwrap();
    assert_eq!(&buf[..n], b"late");
    let _ = sock.abort();
}

#[test]
fn exact_buffer_fill_completes_and_one_more_byte_blocks() {
    let (stack, probe, _clock) = stack_with_timeout(Duration::from_millis(80));
    let sock = stack.socket();
    sock.set_tx_buffer_size(2048).unwrap();
    let mut peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    // Exactly the buffer size fits in one call without waiting.
    let data = vec![0x5a; 2048];
    assert_eq!(sock.send(&data, SendFlags::empty()).unwrap(), 2048);

    // One byte more than fits has to wait for acknowledgements that never
    // come: the call times out on TX_READY.
    assert_eq!(
        sock.send(&[0x5b], SendFlags::empty()),
        Err(TcpError::Timeout)
    );

    // Acknowledging drains the buffer and space reopens.
    let mut sent = 0u32;
    for (_, seg) in probe.drain() {
        sent += seg.payload.len() as u32;
    }
    peer.ack_upto(peer.ack.wrapping_add(sent));
    assert_eq!(sock.send(&[0x5b], SendFlags::empty()).unwrap(), 1);

    let _ = sock.abort();
}

#[test]
fn wait_ack_blocks_until_everything_is_acknowledged() {
    let (stack, probe, _clock) = stack();
    let sock = stack.socket();
    let peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    let probe2 = probe.clone();
    let stack2 = stack.clone();
    let (seq, local, remote) = (peer.seq, peer.local, peer.remote);
    let driver = thread::spawn(move || {
        let mut acked = 0usize;
        while acked < 4000 {
            let Some((_, seg)) = probe2.wait_pop(Duration::from_secs(5)) else {
                panic!("peer saw no segment");
            };
            if seg.payload.is_empty() {
                continue;
            }
            acked += seg.payload.len();
            let upto = seg.seq.wrapping_add(seg.payload.len() as u32);
            stack2.segment_arrives(0, remote, local, tcpcore::Segment::ack(seq, upto, PEER_WND));
        }
    });

    let data = vec![7u8; 4000];
    let n = sock.send(&data, SendFlags::WAIT_ACK).unwrap();
    assert_eq!(n, 4000);
    driver.join().unwrap();
    let _ = sock.abort();
}

#[test]
fn sub_mss_trailer_is_coalesced_until_the_override_fires() {
    let (stack, probe, clock) = stack();
    let sock = stack.socket();
    let mut peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    // Nothing in flight: even a tiny write goes straight out.
    sock.send(b"abc", SendFlags::empty()).unwrap();
    let (_, first) = probe.pop().expect("first write did not go out");
    assert_eq!(first.payload, b"abc");

    // With the first bytes unacknowledged, a second sub-MSS write is held.
    sock.send(b"def", SendFlags::empty()).unwrap();
    assert!(probe.is_empty());

    // The override timer is the escape hatch.
    clock.advance(Duration::from_millis(600));
    stack.on_timer();
    let (_, second) = probe.pop().expect("override did not flush");
    assert_eq!(second.payload, b"def");

    // NO_DELAY skips the coalescing entirely.
    peer.ack_upto(second.seq.wrapping_add(3));
    sock.send(b"ghi", SendFlags::empty()).unwrap();
    let _ = probe.pop().expect("post-ack write did not go out");
    sock.send(b"jkl", SendFlags::NO_DELAY).unwrap();
    let (_, forced) = probe.pop().expect("NO_DELAY write did not go out");
    assert_eq!(forced.payload, b"jkl");

    let _ = sock.abort();
}

#[test]
fn unacked_data_is_retransmitted_after_the_rto() {
    let (stack, probe, clock) = stack();
    let sock = stack.socket();
    let _peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    sock.send(b"important", SendFlags::empty()).unwrap();
    let (_, original) = probe.pop().expect("no data segment");

    clock.advance(Duration::from_millis(1100));
    stack.on_timer();

    let (_, resent) = probe.pop().expect("no retransmission");
    assert_eq!(resent.seq, original.seq);
    assert_eq!(resent.payload, original.payload);

    let _ = sock.abort();
}

#[test]
fn triple_duplicate_ack_triggers_fast_retransmit() {
    let (stack, probe, _clock) = stack();
    let sock = stack.socket();
    let mut peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    sock.send(&[1u8; 1000], SendFlags::NO_DELAY).unwrap();
    let first = probe.drain().remove(0).1;

    // Three duplicate ACKs for the head of the window.
    peer.ack_upto(first.seq);
    peer.ack_upto(first.seq);
    peer.ack_upto(first.seq);

    let resent: Vec<_> = probe.drain();
    assert!(
        resent.iter().any(|(_, seg)| seg.seq == first.seq && !seg.payload.is_empty()),
        "head of window was not fast-retransmitted"
    );

    let _ = sock.abort();
}

#[test]
fn zero_window_is_probed() {
    let (stack, probe, clock) = stack();
    let sock = stack.socket();
    let mut peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    sock.send(&[9u8; 100], SendFlags::NO_DELAY).unwrap();
    let (_, seg) = probe.pop().expect("no data segment");

    // The peer acknowledges but slams its window shut.
    peer.ack = seg.seq.wrapping_add(100);
    peer.inject(tcpcore::Segment::ack(peer.seq, peer.ack, 0));

    // Queued bytes cannot move.
    sock.send(&[8u8; 50], SendFlags::NO_DELAY).unwrap();
    assert!(probe.is_empty());

    // The persist path pushes a single byte past the window edge.
    clock.advance(Duration::from_millis(1100));
    stack.on_timer();
    let (_, probe_seg) = probe.pop().expect("no window probe");
    assert_eq!(probe_seg.payload.len(), 1);
    assert_eq!(probe_seg.payload[0], 8);

    let _ = sock.abort();
}

#[test]
fn receive_surfaces_end_of_stream_after_fin() {
    let (stack, probe, _clock) = stack();
    let sock = stack.socket();
    let mut peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    peer.send_data(b"last words");
    peer.send_fin();
    assert_eq!(sock.state().unwrap(), TcpState::CloseWait);

    let mut buf = [0u8; 64];
    let n = sock.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"last words");

    assert_eq!(sock.receive(&mut buf), Err(TcpError::EndOfStream));
    assert_eq!(sock.receive(&mut buf), Err(TcpError::EndOfStream));

    let _ = sock.abort();
}

#[test]
fn reset_surfaces_on_both_directions() {
    let (stack, probe, _clock) = stack();
    let sock = stack.socket();
    let peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    peer.inject(tcpcore::Segment::rst(peer.seq));
    assert_eq!(sock.state().unwrap(), TcpState::Closed);

    let mut buf = [0u8; 8];
    assert_eq!(sock.receive(&mut buf), Err(TcpError::ConnectionReset));
    assert_eq!(
        sock.send(b"x", SendFlags::empty()),
        Err(TcpError::ConnectionReset)
    );

    let _ = sock.abort();
}

#[test]
fn draining_a_full_receive_buffer_reopens_the_window() {
    let (stack, probe, _clock) = stack();
    let sock = stack.socket();
    sock.set_rx_buffer_size(2048).unwrap();
    let mut peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    // Fill the whole advertised window.
    peer.send_data(&vec![3u8; 2048]);
    let (_, ack) = probe.pop().expect("no ACK for data");
    assert_eq!(ack.wnd, 0);

    // Draining reopens it and emits a window update.
    let mut buf = vec![0u8; 2048];
    let n = sock.receive(&mut buf).unwrap();
    assert_eq!(n, 2048);
    let (_, update) = probe.pop().expect("no window update");
    assert_eq!(update.wnd, 2048);

    let _ = sock.abort();
}

#[test]
fn out_of_order_segment_is_not_delivered() {
    let (stack, probe, _clock) = stack_with_timeout(Duration::from_millis(50));
    let sock = stack.socket();
    let peer = Peer::establish(&stack, &probe, &sock, peer_addr(), 100);

    // A segment one byte past rcv_nxt: reassembly is not ours, so the
    // engine acks its current position and delivers nothing.
    peer.inject(tcpcore::Segment::data(
        peer.seq.wrapping_add(1),
        peer.ack,
        PEER_WND,
        b"gap".to_vec(),
    ));
    let (_, dup_ack) = probe.pop().expect("no duplicate ACK");
    assert_eq!(dup_ack.ack, peer.seq);

    let mut buf = [0u8; 8];
    assert_eq!(sock.receive(&mut buf), Err(TcpError::Timeout));

    let _ = sock.abort();
}

#[test]
fn send_rejected_while_not_connected() {
    let (stack, _probe, _clock) = stack_with_timeout(Duration::from_millis(50));
    let sock = stack.socket();

    // CLOSED without a reset surfaces NOT_CONNECTED.
    assert_eq!(
        sock.send(b"x", SendFlags::empty()),
        Err(TcpError::NotConnected)
    );

    let mut buf = [0u8; 4];
    assert_eq!(sock.receive(&mut buf), Err(TcpError::NotConnected));
}

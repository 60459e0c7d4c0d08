//! Shared harness: a stack wired to a queue-backed wire seam, a scriptable
//! peer, and a hand-driven clock for the timer tests.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tcpcore::{
    QueueTx, Segment, SegmentFlags, StackConfig, StaticRoute, TcpStack, TxProbe,
};

pub const PEER_WND: u16 = 4096;
pub const PEER_MSS: u16 = 1460;

pub fn local_ip() -> IpAddr {
    Ipv4Addr::new(192, 0, 2, 10).into()
}

pub fn peer_addr() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::new(198, 51, 100, 7).into(), 9000)
}

pub fn peer_addr_n(n: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::new(198, 51, 100, 7).into(), 9000 + n)
}

#[derive(Clone)]
pub struct TestClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl TestClock {
    pub fn new() -> Self {
        TestClock {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }

    pub fn hook(&self) -> Arc<dyn Fn() -> Instant + Send + Sync> {
        let base = self.base;
        let offset = self.offset.clone();
        Arc::new(move || base + *offset.lock().unwrap())
    }
}

pub fn stack() -> (Arc<TcpStack>, TxProbe, TestClock) {
    stack_with_timeout(Duration::from_secs(5))
}

pub fn stack_with_timeout(timeout: Duration) -> (Arc<TcpStack>, TxProbe, TestClock) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let clock = TestClock::new();
    let (tx, probe) = QueueTx::new();
    let cfg = StackConfig {
        timeout,
        clock: clock.hook(),
        ..Default::default()
    };
    let stack = TcpStack::with_config(cfg, Box::new(StaticRoute(local_ip())), Box::new(tx));
    (stack, probe, clock)
}

/// Waits for the next outgoing SYN and answers it with a SYN|ACK carrying
/// `peer_iss`. Returns the connection quad as seen locally and our ISS.
pub fn answer_syn(stack: &Arc<TcpStack>, probe: &TxProbe, peer_iss: u32) -> (SocketAddr, SocketAddr, u32) {
    let (quad, syn) = probe
        .wait_pop(Duration::from_secs(5))
        .expect("no SYN emitted");
    assert!(syn.flags.contains(SegmentFlags::SYN));
    assert!(!syn.flags.contains(SegmentFlags::ACK));
    let iss = syn.seq;
    stack.segment_arrives(
        0,
        quad.remote,
        quad.local,
        Segment::syn_ack(peer_iss, iss.wrapping_add(1), PEER_WND, PEER_MSS),
    );
    (quad.local, quad.remote, iss)
}

/// Scripted peer state for one established connection.
pub struct Peer {
    pub stack: Arc<TcpStack>,
    /// Addresses from the local socket's point of view.
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// Local ISS observed during the handshake.
    pub iss: u32,
    /// Next sequence number the peer will send.
    pub seq: u32,
    /// Next local sequence number the peer expects.
    pub ack: u32,
}

impl Peer {
    /// Drives the active-open handshake to completion and consumes the
    /// final ACK off the probe.
    pub fn establish(
        stack: &Arc<TcpStack>,
        probe: &TxProbe,
        sock: &tcpcore::TcpSocket,
        remote: SocketAddr,
        peer_iss: u32,
    ) -> Peer {
        let stack2 = stack.clone();
        let probe2 = probe.clone();
        let driver =
            std::thread::spawn(move || answer_syn(&stack2, &probe2, peer_iss));
        sock.connect(remote).expect("connect failed");
        let (local, remote, iss) = driver.join().unwrap();

        let (_, ack) = probe
            .wait_pop(Duration::from_secs(5))
            .expect("no handshake ACK");
        assert_eq!(ack.flags, SegmentFlags::ACK);
        assert_eq!(ack.seq, iss.wrapping_add(1));
        assert_eq!(ack.ack, peer_iss.wrapping_add(1));

        Peer {
            stack: stack.clone(),
            local,
            remote,
            iss,
            seq: peer_iss.wrapping_add(1),
            ack: iss.wrapping_add(1),
        }
    }

    pub fn inject(&self, seg: Segment) {
        self.stack.segment_arrives(0, self.remote, self.local, seg);
    }

    /// Acknowledges everything sent up to `upto`.
    pub fn ack_upto(&mut self, upto: u32) {
        self.ack = upto;
        self.inject(Segment::ack(self.seq, upto, PEER_WND));
    }

    /// Delivers `payload` in-order and advances the peer cursor.
    pub fn send_data(&mut self, payload: &[u8]) {
        let seg = Segment::data(self.seq, self.ack, PEER_WND, payload.to_vec());
        self.seq = self.seq.wrapping_add(payload.len() as u32);
        self.inject(seg);
    }

    /// Sends the peer's FIN and advances the cursor past it.
    pub fn send_fin(&mut self) {
        let seg = Segment::fin_ack(self.seq, self.ack, PEER_WND);
        self.seq = self.seq.wrapping_add(1);
        self.inject(seg);
    }
}

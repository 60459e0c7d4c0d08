use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bitflags::bitflags;

bitflags! {
    /// Level-triggered readiness bits of one socket.
    ///
    /// Bits are recomputed from control-block and buffer state after every
    /// mutation, so a waiter observes a condition that already holds rather
    /// than a pulse it may have missed.
    pub struct Events: u16 {
        /// The handshake completed.
        const CONNECTED   = 1 << 0;
        /// The connection reached CLOSED.
        const CLOSED      = 1 << 1;
        /// The transmit buffer can take more bytes (or send would fail fast).
        const TX_READY    = 1 << 2;
        /// Every buffered byte has been handed to the wire.
        const TX_DONE     = 1 << 3;
        /// Every sent byte has been acknowledged.
        const TX_ACKED    = 1 << 4;
        /// A shutdown wait may complete (our FIN acked, or the peer's
        /// FIN consumed).
        const TX_SHUTDOWN = 1 << 5;
        /// Received bytes (or an end-of-stream condition) await the user.
        const RX_READY    = 1 << 6;
        /// The SYN queue holds at least one pending connection.
        const ACCEPT      = 1 << 7;
    }
}

/// The per-socket wait/notify primitive.
///
/// This is the only channel over which the segment-handler and timer threads
/// wake a blocked user call. The bus has its own short-lived lock; it is
/// never held across any other acquisition.
pub(crate) struct EventBus {
    bits: Mutex<Events>,
    cond: Condvar,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            bits: Mutex::new(Events::empty()),
            cond: Condvar::new(),
        }
    }

    pub fn snapshot(&self) -> Events {
        *self.bits.lock().unwrap()
    }

    /// Applies a recomputed level: sets `set`, clears `clear`, and wakes
    /// waiters when any bit newly appeared.
    pub fn apply(&self, set: Events, clear: Events) {
        let mut bits = self.bits.lock().unwrap();
        let before = *bits;
        bits.insert(set);
        bits.remove(clear - set);
        if !(*bits - before).is_empty() {
            self.cond.notify_all();
        }
    }

    /// Blocks until a bit of `mask` is set, for at most `timeout`.
    ///
    /// Returns the matching bits, or empty on timeout. A bit already set on
    /// entry satisfies the wait immediately.
    pub fn wait(&self, mask: Events, timeout: Duration) -> Events {
        let deadline = Instant::now() + timeout;
        let mut bits = self.bits.lock().unwrap();
        loop {
            let hit = *bits & mask;
            if !hit.is_empty() {
                return hit;
            }
            let now = Instant::now();
            if now >= deadline {
                return Events::empty();
            }
            let (guard, _) = self.cond.wait_timeout(bits, deadline - now).unwrap();
            bits = guard;
        }
    }
}

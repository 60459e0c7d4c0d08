use std::sync::Mutex;

use rand::Rng;

pub(crate) const EPHEMERAL_MIN: u16 = 49152;
pub(crate) const EPHEMERAL_MAX: u16 = 65535;

static NEXT_PORT: Mutex<u16> = Mutex::new(0);

/// Hands out the next ephemeral port.
///
/// A process-wide counter walks the IANA dynamic range, reseeded from the
/// thread CSPRNG on first use, and wrapping back to the range start at the
/// top. Collisions with bound sockets are the bind layer's problem; a
/// duplicate simply makes that bind retry.
pub(crate) fn next_ephemeral() -> u16 {
    let mut next = NEXT_PORT.lock().unwrap();
    if *next < EPHEMERAL_MIN {
        *next = rand::thread_rng().gen_range(EPHEMERAL_MIN..=EPHEMERAL_MAX);
    }
    let port = *next;
    *next = if port == EPHEMERAL_MAX {
        EPHEMERAL_MIN
    } else {
        port + 1
    };
    port
}

use std::time::{Duration, Instant};

/// A one-shot timer measured against the stack clock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TcpTimer {
    started: Option<Instant>,
    interval: Duration,
}

impl TcpTimer {
    pub fn stopped(interval: Duration) -> Self {
        TcpTimer {
            started: None,
            interval,
        }
    }

    pub fn restart(&mut self, now: Instant, interval: Duration) {
        self.interval = interval;
        self.started = Some(now);
    }

    pub fn stop(&mut self) {
        self.started = None;
    }

    pub fn running(&self) -> bool {
        self.started.is_some()
    }

    pub fn expired(&self, now: Instant) -> bool {
        match self.started {
            Some(at) => now.duration_since(at) >= self.interval,
            None => false,
        }
    }

    /// When the timer was armed; orders TIME_WAIT entries for the reaper.
    pub fn start_time(&self) -> Option<Instant> {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_after_interval() {
        let t0 = Instant::now();
        let mut timer = TcpTimer::stopped(Duration::from_millis(100));
        assert!(!timer.expired(t0));

        timer.restart(t0, Duration::from_millis(100));
        assert!(timer.running());
        assert!(!timer.expired(t0 + Duration::from_millis(99)));
        assert!(timer.expired(t0 + Duration::from_millis(100)));

        timer.stop();
        assert!(!timer.expired(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn restart_replaces_the_interval() {
        let t0 = Instant::now();
        let mut timer = TcpTimer::stopped(Duration::from_millis(100));
        timer.restart(t0, Duration::from_millis(500));
        assert!(!timer.expired(t0 + Duration::from_millis(200)));
        assert!(timer.expired(t0 + Duration::from_millis(500)));
    }
}

use crate::config::{TCP_DUP_ACK_THRESHOLD, TCP_INITIAL_WINDOW};
use crate::seq;
use crate::tcb::Tcb;

/// Congestion phase of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestState {
    /// Normal slow-start / congestion-avoidance growth.
    #[default]
    Idle,
    /// Fast recovery after a triple duplicate ACK.
    Recovery,
    /// Recovery after a retransmission timeout.
    LossRecovery,
}

fn sat16(value: u32) -> u16 {
    value.min(u32::from(u16::MAX)) as u16
}

impl Tcb {
    /// Seeds the congestion variables at connection setup.
    ///
    /// The window is computed in 32-bit space and saturated into the stored
    /// `u16`, identically on the active-open and accept paths.
    pub(crate) fn cong_init(&mut self) {
        let smss = u32::from(self.smss);
        let cwnd = (u32::from(TCP_INITIAL_WINDOW) * smss)
            .min(self.tx_size as u32)
            .max(smss);
        self.cwnd = sat16(cwnd);
        self.ssthresh = u16::MAX;
        self.recover = self.iss;
        self.congest = CongestState::Idle;
        self.dup_acks = 0;
    }

    /// Window growth for `acked` newly acknowledged bytes.
    pub(crate) fn cong_on_ack(&mut self, acked: u32) {
        self.dup_acks = 0;
        match self.congest {
            CongestState::Idle => self.cong_grow(acked),
            CongestState::Recovery | CongestState::LossRecovery => {
                if seq::ge(self.snd_una, self.recover) {
                    // Past the recovery fence: deflate and resume normally.
                    self.cwnd = self.ssthresh.max(self.smss);
                    self.congest = CongestState::Idle;
                } else {
                    self.cong_grow(acked);
                }
            }
        }
    }

    fn cong_grow(&mut self, acked: u32) {
        let cwnd = u32::from(self.cwnd);
        let smss = u32::from(self.smss);
        let next = if cwnd < u32::from(self.ssthresh) {
            // Slow start (RFC 5681): at most one SMSS per ACK.
            cwnd + acked.min(smss)
        } else {
            // Congestion avoidance.
            cwnd + (smss * smss / cwnd.max(1)).max(1)
        };
        self.cwnd = sat16(next);
    }

    /// Accounts one duplicate ACK; returns whether the caller should fast
    /// retransmit the head of the window now.
    pub(crate) fn cong_on_dup_ack(&mut self) -> bool {
        self.dup_acks += 1;
        let smss = u32::from(self.smss);
        match self.congest {
            CongestState::Idle if self.dup_acks == TCP_DUP_ACK_THRESHOLD => {
                self.ssthresh = sat16((self.flight() / 2).max(2 * smss));
                self.recover = self.snd_nxt;
                self.congest = CongestState::Recovery;
                self.cwnd = sat16(u32::from(self.ssthresh) + 3 * smss);
                true
            }
            CongestState::Recovery => {
                // Window inflation while the loss drains.
                self.cwnd = sat16(u32::from(self.cwnd) + smss);
                false
            }
            _ => false,
        }
    }

    /// Congestion collapse on a retransmission timeout.
    pub(crate) fn cong_on_rto(&mut self) {
        let smss = u32::from(self.smss);
        self.ssthresh = sat16((self.flight() / 2).max(2 * smss));
        self.cwnd = self.smss;
        self.recover = self.snd_nxt;
        self.congest = CongestState::LossRecovery;
        self.dup_acks = 0;
    }
}

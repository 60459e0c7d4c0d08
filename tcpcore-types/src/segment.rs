use std::fmt::Display;

use bitflags::bitflags;

bitflags! {
    /// Flag byte of a segment, matching the low six bits of the TCP header.
    pub struct SegmentFlags: u8 {
        const FIN = 0b0000_0001;
        const SYN = 0b0000_0010;
        const RST = 0b0000_0100;
        const PSH = 0b0000_1000;
        const ACK = 0b0001_0000;
        const URG = 0b0010_0000;
    }
}

impl Display for SegmentFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (bit, c) in [
            (SegmentFlags::FIN, 'F'),
            (SegmentFlags::SYN, 'S'),
            (SegmentFlags::RST, 'R'),
            (SegmentFlags::PSH, 'P'),
            (SegmentFlags::ACK, 'A'),
            (SegmentFlags::URG, 'U'),
        ] {
            if self.contains(bit) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// A decoded segment, as exchanged with the wire-side collaborator.
///
/// Header encoding, checksumming and option parsing happen outside the
/// engine; only the fields the state machine consumes cross this seam. The
/// MSS option is the sole option carried, and only on SYN segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub flags: SegmentFlags,
    pub seq: u32,
    pub ack: u32,
    pub wnd: u16,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Sequence-space footprint: payload bytes plus the virtual SYN/FIN bytes.
    #[must_use]
    pub fn wire_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.contains(SegmentFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(SegmentFlags::FIN) {
            len += 1;
        }
        len
    }

    #[must_use]
    pub fn syn(seq: u32, wnd: u16, mss: u16) -> Segment {
        Segment {
            flags: SegmentFlags::SYN,
            seq,
            ack: 0,
            wnd,
            mss: Some(mss),
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn syn_ack(seq: u32, ack: u32, wnd: u16, mss: u16) -> Segment {
        Segment {
            flags: SegmentFlags::SYN | SegmentFlags::ACK,
            seq,
            ack,
            wnd,
            mss: Some(mss),
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn ack(seq: u32, ack: u32, wnd: u16) -> Segment {
        Segment {
            flags: SegmentFlags::ACK,
            seq,
            ack,
            wnd,
            mss: None,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn data(seq: u32, ack: u32, wnd: u16, payload: Vec<u8>) -> Segment {
        Segment {
            flags: SegmentFlags::ACK | SegmentFlags::PSH,
            seq,
            ack,
            wnd,
            mss: None,
            payload,
        }
    }

    #[must_use]
    pub fn fin_ack(seq: u32, ack: u32, wnd: u16) -> Segment {
        Segment {
            flags: SegmentFlags::FIN | SegmentFlags::ACK,
            seq,
            ack,
            wnd,
            mss: None,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn rst(seq: u32) -> Segment {
        Segment {
            flags: SegmentFlags::RST,
            seq,
            ack: 0,
            wnd: 0,
            mss: None,
            payload: Vec::new(),
        }
    }
}

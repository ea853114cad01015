//! decoder.rs
//! Byte-at-a-time MSP frame reconstruction.
//!
//! Each input byte advances the machine by exactly one transition. Anything
//! unexpected (bad version or direction byte, oversize length, checksum
//! mismatch) abandons the frame and returns to `Idle`; the bytes seen after
//! the abandoned frame's `$` are then replayed so a real frame hiding inside
//! them is still found.

use std::collections::VecDeque;

use log::trace;

use crate::msp::crc::crc8_dvb_s2;
use crate::msp::frame::{
    Direction, JUMBO_ESCAPE, MSP_MAX_PAYLOAD, MspFrame, MspVersion, SYNC_BYTE,
};

/// Position in frame reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Idle,
    /// Got `$`, expecting `M` or `X`.
    Sync,
    /// Expecting `<`, `>` or `!`.
    Direction,
    V1Length,
    V1Command,
    V1JumboLengthLow,
    V1JumboLengthHigh,
    V1Payload,
    V1Checksum,
    V2Flag,
    V2CommandLow,
    V2CommandHigh,
    V2LengthLow,
    V2LengthHigh,
    V2Payload,
    V2Checksum,
}

/// Counters kept for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    pub checksum_errors: u64,
    pub oversize: u64,
    pub bad_header: u64,
}

enum Step {
    Pending,
    Frame(MspFrame),
    /// Frame abandoned; carries the bytes after its `$` for replay.
    Rejected(Vec<u8>),
}

pub struct MspDecoder {
    state: DecoderState,
    version: MspVersion,
    direction: Direction,
    flags: u8,
    command: u16,
    length: usize,
    jumbo: bool,
    checksum: u8,
    payload: Vec<u8>,
    raw: Vec<u8>,
    max_payload: usize,
    stats: DecoderStats,
}

impl Default for MspDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MspDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MSP_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            state: DecoderState::Idle,
            version: MspVersion::V1,
            direction: Direction::ToDevice,
            flags: 0,
            command: 0,
            length: 0,
            jumbo: false,
            checksum: 0,
            payload: Vec::with_capacity(max_payload.min(256)),
            raw: Vec::new(),
            max_payload,
            stats: DecoderStats::default(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Feed one byte; `on_frame` runs for every frame completed by it.
    ///
    /// Usually that is zero or one frame, but a rejection can replay buffered
    /// bytes that complete several.
    pub fn feed<F: FnMut(MspFrame)>(&mut self, byte: u8, mut on_frame: F) {
        let mut replay: VecDeque<u8> = VecDeque::new();
        let mut next = Some(byte);
        while let Some(b) = next {
            match self.step(b) {
                Step::Pending => {}
                Step::Frame(frame) => on_frame(frame),
                Step::Rejected(bytes) => {
                    for x in bytes.into_iter().rev() {
                        replay.push_front(x);
                    }
                }
            }
            next = replay.pop_front();
        }
    }

    /// Decode a whole slice, collecting completed frames in order.
    pub fn decode(&mut self, data: &[u8]) -> Vec<MspFrame> {
        let mut frames = Vec::new();
        for &b in data {
            self.feed(b, |f| frames.push(f));
        }
        frames
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::Idle;
        self.flags = 0;
        self.command = 0;
        self.length = 0;
        self.jumbo = false;
        self.checksum = 0;
        self.payload.clear();
        self.raw.clear();
    }

    fn step(&mut self, b: u8) -> Step {
        use DecoderState as S;

        if self.state == S::Idle {
            if b == SYNC_BYTE {
                self.reset();
                self.raw.push(b);
                self.state = S::Sync;
            }
            return Step::Pending;
        }
        self.raw.push(b);

        match self.state {
            S::Idle => {}
            S::Sync => match MspVersion::from_sync(b) {
                Some(v) => {
                    self.version = v;
                    self.state = S::Direction;
                }
                None => return self.reject_header(),
            },
            S::Direction => match Direction::from_byte(b) {
                Some(d) => {
                    self.direction = d;
                    self.state = match self.version {
                        MspVersion::V1 => S::V1Length,
                        MspVersion::V2 => S::V2Flag,
                    };
                }
                None => return self.reject_header(),
            },

            S::V1Length => {
                self.checksum = b;
                self.jumbo = b == JUMBO_ESCAPE;
                self.length = if self.jumbo { 0 } else { b as usize };
                self.state = S::V1Command;
            }
            S::V1Command => {
                self.checksum ^= b;
                self.command = u16::from(b);
                if self.jumbo {
                    self.state = S::V1JumboLengthLow;
                } else {
                    return self.begin_payload(S::V1Payload, S::V1Checksum);
                }
            }
            S::V1JumboLengthLow => {
                self.checksum ^= b;
                self.length = b as usize;
                self.state = S::V1JumboLengthHigh;
            }
            S::V1JumboLengthHigh => {
                self.checksum ^= b;
                self.length |= (b as usize) << 8;
                return self.begin_payload(S::V1Payload, S::V1Checksum);
            }
            S::V1Payload => {
                self.checksum ^= b;
                self.payload.push(b);
                if self.payload.len() == self.length {
                    self.state = S::V1Checksum;
                }
            }

            S::V2Flag => {
                self.flags = b;
                self.checksum = crc8_dvb_s2(0, b);
                self.state = S::V2CommandLow;
            }
            S::V2CommandLow => {
                self.checksum = crc8_dvb_s2(self.checksum, b);
                self.command = u16::from(b);
                self.state = S::V2CommandHigh;
            }
            S::V2CommandHigh => {
                self.checksum = crc8_dvb_s2(self.checksum, b);
                self.command |= u16::from(b) << 8;
                self.state = S::V2LengthLow;
            }
            S::V2LengthLow => {
                self.checksum = crc8_dvb_s2(self.checksum, b);
                self.length = b as usize;
                self.state = S::V2LengthHigh;
            }
            S::V2LengthHigh => {
                self.checksum = crc8_dvb_s2(self.checksum, b);
                self.length |= (b as usize) << 8;
                return self.begin_payload(S::V2Payload, S::V2Checksum);
            }
            S::V2Payload => {
                self.checksum = crc8_dvb_s2(self.checksum, b);
                self.payload.push(b);
                if self.payload.len() == self.length {
                    self.state = S::V2Checksum;
                }
            }

            S::V1Checksum | S::V2Checksum => {
                if b == self.checksum {
                    return self.complete();
                }
                self.stats.checksum_errors += 1;
                trace!(
                    "[MSP] checksum mismatch cmd={} got=0x{:02X} want=0x{:02X}",
                    self.command, b, self.checksum
                );
                return self.reject();
            }
        }
        Step::Pending
    }

    /// Enter the payload state, or skip straight to the checksum for empty frames.
    fn begin_payload(&mut self, payload: DecoderState, checksum: DecoderState) -> Step {
        if self.length > self.max_payload {
            self.stats.oversize += 1;
            trace!("[MSP] oversize frame len={} cmd={}", self.length, self.command);
            return self.reject();
        }
        self.state = if self.length == 0 { checksum } else { payload };
        Step::Pending
    }

    fn complete(&mut self) -> Step {
        let frame = MspFrame {
            version: self.version,
            direction: self.direction,
            flags: self.flags,
            command: self.command,
            payload: std::mem::take(&mut self.payload),
        };
        self.stats.frames += 1;
        self.reset();
        Step::Frame(frame)
    }

    fn reject_header(&mut self) -> Step {
        self.stats.bad_header += 1;
        self.reject()
    }

    fn reject(&mut self) -> Step {
        let mut raw = std::mem::take(&mut self.raw);
        self.reset();
        if raw.is_empty() {
            return Step::Pending;
        }
        raw.remove(0);
        Step::Rejected(raw)
    }
}

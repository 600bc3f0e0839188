//! NMEA 2000 fast packet reassembly
//!
//! Fast packet PGNs carry up to 223 bytes in a run of frames sharing a 3-bit
//! sequence counter. Frame 0 holds the total length and 6 payload bytes, later
//! frames 7 payload bytes each. The combined frame keeps the original
//! identifier and the timestamp of frame 0, and holds the payload only.

use super::{MultiFrameReassembler, Pending};
use crate::signals::j1939_pgn;
use crate::types::{RawFrame, RawFrameTable, Result};
use std::collections::{HashMap, HashSet};

/// Commonly logged fast packet PGNs
pub const DEFAULT_FAST_PACKET_PGNS: [u32; 24] = [
    126208, 126464, 126720, 126996, 126998, 127233, 127237, 127489, 127496, 127497, 127503, 127506,
    128275, 129029, 129038, 129039, 129040, 129284, 129285, 129540, 129794, 129809, 130074, 130577,
];

/// Fast packet reassembler for a set of PGNs
#[derive(Debug, Clone)]
pub struct FastPacketReassembler {
    pgns: HashSet<u32>,
}

impl Default for FastPacketReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FastPacketReassembler {
    pub fn new() -> Self {
        Self::with_pgns(DEFAULT_FAST_PACKET_PGNS)
    }

    pub fn with_pgns(pgns: impl IntoIterator<Item = u32>) -> Self {
        Self {
            pgns: pgns.into_iter().collect(),
        }
    }

    fn is_fast_packet(&self, frame: &RawFrame) -> bool {
        frame.is_extended && self.pgns.contains(&j1939_pgn(frame.id))
    }
}

impl MultiFrameReassembler for FastPacketReassembler {
    fn combine(&self, frames: RawFrameTable) -> Result<RawFrameTable> {
        let mut output = Vec::new();
        let mut pending: HashMap<(u8, u32, u8), Pending> = HashMap::new();

        for frame in frames.into_frames() {
            if !self.is_fast_packet(&frame) || frame.data.len() < 2 {
                output.push(frame);
                continue;
            }

            let counter = frame.data[0] >> 5;
            let index = frame.data[0] & 0x1F;
            let key = (frame.channel, frame.id, counter);

            if index == 0 {
                let total_len = usize::from(frame.data[1]);
                let session = Pending::new(frame.timestamp_ns, total_len, 1, frame.data[2..].to_vec());
                if session.is_complete() {
                    output.push(RawFrame {
                        data: session.into_payload(),
                        ..frame
                    });
                } else {
                    pending.insert(key, session);
                }
                continue;
            }

            let Some(session) = pending.get_mut(&key) else {
                continue;
            };
            if index != session.next_index {
                log::debug!("Fast packet sequence error on 0x{:08X}", frame.id);
                pending.remove(&key);
                continue;
            }
            session.next_index += 1;
            session.data.extend_from_slice(&frame.data[1..]);

            if session.is_complete() {
                if let Some(session) = pending.remove(&key) {
                    output.push(RawFrame {
                        timestamp_ns: session.timestamp_ns,
                        data: session.into_payload(),
                        ..frame
                    });
                }
            }
        }

        if !pending.is_empty() {
            log::debug!("{} incomplete fast packets dropped", pending.len());
        }
        Ok(RawFrameTable::from_frames(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // PGN 129029 (GNSS position data) from source 0x23, priority 3
    const GNSS_ID: u32 = 0x0DF80523;

    fn frame(timestamp_ns: u64, data: &[u8]) -> RawFrame {
        RawFrame {
            timestamp_ns,
            channel: 1,
            id: GNSS_ID,
            is_extended: true,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_fast_packet_sequence() {
        assert_eq!(j1939_pgn(GNSS_ID), 129029);

        let frames = RawFrameTable::from_frames(vec![
            frame(10, &[0x40, 15, 1, 2, 3, 4, 5, 6]),
            frame(11, &[0x41, 7, 8, 9, 10, 11, 12, 13]),
            frame(12, &[0x42, 14, 15, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
        ]);

        let combined = FastPacketReassembler::new().combine(frames).unwrap();
        assert_eq!(combined.len(), 1);
        let message = &combined.frames()[0];
        assert_eq!(message.timestamp_ns, 10);
        assert_eq!(message.id, GNSS_ID);
        assert_eq!(message.data, (1..=15).collect::<Vec<u8>>());
    }

    #[test]
    fn test_counters_are_separate_sessions() {
        let frames = RawFrameTable::from_frames(vec![
            frame(1, &[0x20, 8, 1, 1, 1, 1, 1, 1]),
            frame(2, &[0x40, 8, 2, 2, 2, 2, 2, 2]),
            frame(3, &[0x41, 2, 2, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
            frame(4, &[0x21, 1, 1, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
        ]);
        let combined = FastPacketReassembler::new().combine(frames).unwrap();
        let firsts: Vec<_> = combined.iter().map(|f| f.data[0]).collect();
        assert_eq!(firsts, vec![1, 2]);
    }

    #[test]
    fn test_other_pgns_pass_through() {
        let frames = RawFrameTable::from_frames(vec![frame(1, &[0x40, 15, 1, 2, 3, 4, 5, 6])]);
        let combined = FastPacketReassembler::with_pgns([127250]).combine(frames.clone()).unwrap();
        assert_eq!(combined, frames);
    }
}

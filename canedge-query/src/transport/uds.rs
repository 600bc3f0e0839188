//! ISO-TP (ISO 15765-2) reassembly for UDS / OBD-II responses
//!
//! A first frame (PCI `0x1`) announces a 12-bit payload length, consecutive
//! frames (PCI `0x2`) carry a 4-bit sequence number. The combined frame keeps
//! the two first-frame PCI bytes followed by the payload, and the first
//! frame's timestamp. Flow control frames are dropped; single frames pass
//! through unchanged.

use super::{MultiFrameReassembler, Pending};
use crate::types::{RawFrame, RawFrameTable, Result};
use std::collections::HashMap;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

/// Bytes of protocol control information kept at the head of a combined frame
const FIRST_FRAME_PCI_LEN: usize = 2;

/// ISO-TP reassembler for diagnostic response identifiers
#[derive(Debug, Clone, Default)]
pub struct IsoTpReassembler {
    extra_ids: Vec<u32>,
}

impl IsoTpReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: reassemble an additional response identifier
    pub fn with_response_id(mut self, id: u32) -> Self {
        self.extra_ids.push(id);
        self
    }

    /// OBD-II responses (0x7E8-0x7EF), 29-bit physical responses (0x18DAxxxx)
    fn is_response_id(&self, frame: &RawFrame) -> bool {
        if self.extra_ids.contains(&frame.id) {
            return true;
        }
        if frame.is_extended {
            frame.id & 0xFFFF_0000 == 0x18DA_0000
        } else {
            (0x7E8..=0x7EF).contains(&frame.id)
        }
    }
}

impl MultiFrameReassembler for IsoTpReassembler {
    fn combine(&self, frames: RawFrameTable) -> Result<RawFrameTable> {
        let mut output = Vec::new();
        let mut pending: HashMap<(u8, u32), Pending> = HashMap::new();

        for frame in frames.into_frames() {
            if !self.is_response_id(&frame) || frame.data.is_empty() {
                output.push(frame);
                continue;
            }

            let key = (frame.channel, frame.id);
            match frame.data[0] >> 4 {
                PCI_SINGLE => output.push(frame),
                PCI_FIRST => {
                    if frame.data.len() < FIRST_FRAME_PCI_LEN {
                        log::debug!("Short first frame on 0x{:X}", frame.id);
                        continue;
                    }
                    let total_len =
                        (usize::from(frame.data[0] & 0x0F) << 8 | usize::from(frame.data[1])) + FIRST_FRAME_PCI_LEN;
                    if pending
                        .insert(key, Pending::new(frame.timestamp_ns, total_len, 1, frame.data))
                        .is_some()
                    {
                        log::debug!("Abandoned incomplete ISO-TP message on 0x{:X}", frame.id);
                    }
                }
                PCI_CONSECUTIVE => {
                    let Some(session) = pending.get_mut(&key) else {
                        continue;
                    };
                    let sequence = frame.data[0] & 0x0F;
                    if sequence != session.next_index {
                        log::debug!(
                            "ISO-TP sequence error on 0x{:X}: expected {}, got {}",
                            frame.id,
                            session.next_index,
                            sequence
                        );
                        pending.remove(&key);
                        continue;
                    }
                    session.next_index = (session.next_index + 1) & 0x0F;
                    session.data.extend_from_slice(&frame.data[1..]);

                    if session.is_complete() {
                        if let Some(session) = pending.remove(&key) {
                            output.push(RawFrame {
                                timestamp_ns: session.timestamp_ns,
                                channel: frame.channel,
                                id: frame.id,
                                is_extended: frame.is_extended,
                                data: session.into_payload(),
                            });
                        }
                    }
                }
                PCI_FLOW_CONTROL => {}
                _ => output.push(frame),
            }
        }

        if !pending.is_empty() {
            log::debug!("{} incomplete ISO-TP messages dropped", pending.len());
        }
        Ok(RawFrameTable::from_frames(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(timestamp_ns: u64, id: u32, data: &[u8]) -> RawFrame {
        RawFrame {
            timestamp_ns,
            channel: 1,
            id,
            is_extended: id > 0x7FF,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_first_and_consecutive_frames() {
        // 20-byte response: 6 bytes in the first frame, 7 + 7 in consecutive frames
        let frames = RawFrameTable::from_frames(vec![
            frame(10, 0x7E8, &[0x10, 0x14, 0x62, 0xF1, 0x90, 0x57, 0x30, 0x4C]),
            frame(11, 0x7E0, &[0x30, 0x00, 0x00, 0, 0, 0, 0, 0]),
            frame(12, 0x7E8, &[0x21, 1, 2, 3, 4, 5, 6, 7]),
            frame(13, 0x7E8, &[0x22, 8, 9, 10, 11, 12, 13, 14]),
            frame(14, 0x7E8, &[0x03, 0x41, 0x0D, 0x32, 0, 0, 0, 0]),
        ]);

        let combined = IsoTpReassembler::new().combine(frames).unwrap();
        assert_eq!(combined.len(), 3);

        let message = &combined.frames()[0];
        assert_eq!(message.timestamp_ns, 10);
        assert_eq!(message.data.len(), 22);
        assert_eq!(&message.data[..3], &[0x10, 0x14, 0x62]);
        assert_eq!(message.data[21], 14);

        // Request-side flow control frames are not response IDs and pass through
        assert_eq!(combined.frames()[1].id, 0x7E0);
        assert_eq!(combined.frames()[2].data[0], 0x03);
    }

    #[test]
    fn test_sequence_error_drops_message() {
        let frames = RawFrameTable::from_frames(vec![
            frame(10, 0x18DAF100, &[0x10, 0x0A, 1, 2, 3, 4, 5, 6]),
            frame(12, 0x18DAF100, &[0x22, 7, 8, 9, 10, 0, 0, 0]),
        ]);
        let combined = IsoTpReassembler::new().combine(frames).unwrap();
        assert!(combined.is_empty());
    }

    #[test]
    fn test_extra_response_id() {
        let frames = RawFrameTable::from_frames(vec![
            frame(1, 0x641, &[0x10, 0x08, 1, 2, 3, 4, 5, 6]),
            frame(2, 0x641, &[0x21, 7, 8, 0, 0, 0, 0, 0]),
        ]);
        let combined = IsoTpReassembler::new()
            .with_response_id(0x641)
            .combine(frames)
            .unwrap();
        assert_eq!(combined.frames()[0].data, vec![0x10, 0x08, 1, 2, 3, 4, 5, 6, 7, 8]);
    }
}

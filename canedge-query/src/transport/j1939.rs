//! J1939-21 transport protocol reassembly
//!
//! Messages longer than 8 bytes are announced with a TP.CM frame (PF `0xEC`),
//! either as broadcast (BAM) or as an RTS/CTS connection, and carried in
//! numbered TP.DT frames (PF `0xEB`) of 7 payload bytes each. The combined
//! frame is addressed with the transported PGN and the sender's source
//! address, and takes the timestamp of the TP.CM frame.

use super::{MultiFrameReassembler, Pending};
use crate::types::{RawFrame, RawFrameTable, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;

const PF_CONNECTION_MANAGEMENT: u32 = 0xEC;
const PF_DATA_TRANSFER: u32 = 0xEB;

const CONTROL_RTS: u8 = 0x10;
const CONTROL_BAM: u8 = 0x20;

/// J1939 TP.CM / TP.DT reassembler
#[derive(Debug, Clone, Copy, Default)]
pub struct J1939TpReassembler;

impl J1939TpReassembler {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
struct Session {
    pending: Pending,
    pgn: u32,
    priority: u32,
    packets: u8,
}

fn pdu_format(id: u32) -> u32 {
    (id >> 16) & 0xFF
}

impl MultiFrameReassembler for J1939TpReassembler {
    fn combine(&self, frames: RawFrameTable) -> Result<RawFrameTable> {
        let mut output = Vec::new();
        let mut sessions: HashMap<(u8, u32), Session> = HashMap::new();

        for frame in frames.into_frames() {
            if !frame.is_extended {
                output.push(frame);
                continue;
            }

            let source_address = frame.id & 0xFF;
            let key = (frame.channel, source_address);

            match pdu_format(frame.id) {
                PF_CONNECTION_MANAGEMENT => {
                    if frame.data.len() < 8 {
                        log::debug!("Short TP.CM frame 0x{:08X}", frame.id);
                        continue;
                    }
                    // CTS, EndOfMsgAck and Abort carry no payload
                    if frame.data[0] != CONTROL_BAM && frame.data[0] != CONTROL_RTS {
                        continue;
                    }
                    let total_len = usize::from(LittleEndian::read_u16(&frame.data[1..3]));
                    let session = Session {
                        pending: Pending::new(frame.timestamp_ns, total_len, 1, Vec::with_capacity(total_len)),
                        pgn: LittleEndian::read_u24(&frame.data[5..8]),
                        priority: (frame.id >> 26) & 0x7,
                        packets: frame.data[3],
                    };
                    log::trace!(
                        "TP.CM from 0x{:02X}: PGN {} with {} bytes",
                        source_address,
                        session.pgn,
                        total_len
                    );
                    sessions.insert(key, session);
                }
                PF_DATA_TRANSFER => {
                    let Some(session) = sessions.get_mut(&key) else {
                        continue;
                    };
                    if frame.data.is_empty() || frame.data[0] != session.pending.next_index {
                        log::debug!("TP.DT sequence error from 0x{:02X}", source_address);
                        sessions.remove(&key);
                        continue;
                    }
                    session.pending.next_index = session.pending.next_index.wrapping_add(1);
                    session.pending.data.extend_from_slice(&frame.data[1..]);

                    let received = session.pending.next_index.wrapping_sub(1);
                    if session.pending.is_complete() || received >= session.packets {
                        if let Some(session) = sessions.remove(&key) {
                            let id = session.priority << 26 | session.pgn << 8 | source_address;
                            output.push(RawFrame {
                                timestamp_ns: session.pending.timestamp_ns,
                                channel: frame.channel,
                                id,
                                is_extended: true,
                                data: session.pending.into_payload(),
                            });
                        }
                    }
                }
                _ => output.push(frame),
            }
        }

        if !sessions.is_empty() {
            log::debug!("{} incomplete J1939 transport sessions dropped", sessions.len());
        }
        Ok(RawFrameTable::from_frames(output))
    }
}

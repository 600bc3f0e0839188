//! Multi-frame transport reassembly
//!
//! Some signals span several bus frames. A reassembler combines the frames of
//! a transport protocol session into one frame carrying the complete payload,
//! which is then decoded like any other frame. Frames that are not part of a
//! transport session pass through unchanged.

pub mod j1939;
pub mod nmea;
pub mod uds;

use crate::config::TransportProtocol;
use crate::types::{RawFrameTable, Result};

pub use j1939::J1939TpReassembler;
pub use nmea::FastPacketReassembler;
pub use uds::IsoTpReassembler;

/// Combines multi-frame messages of one transport protocol family
pub trait MultiFrameReassembler: Send + Sync {
    /// Reassemble the sessions in `frames`; the result is ordered by timestamp
    fn combine(&self, frames: RawFrameTable) -> Result<RawFrameTable>;
}

/// Reassembler for a configured protocol family, `None` for no reassembly
pub fn reassembler_for(protocol: TransportProtocol) -> Option<Box<dyn MultiFrameReassembler>> {
    match protocol {
        TransportProtocol::None => None,
        TransportProtocol::Uds => Some(Box::new(IsoTpReassembler::new())),
        TransportProtocol::J1939 => Some(Box::new(J1939TpReassembler::new())),
        TransportProtocol::Nmea => Some(Box::new(FastPacketReassembler::new())),
    }
}

/// Payload collected for one in-progress transport session
#[derive(Debug, Clone)]
struct Pending {
    timestamp_ns: u64,
    total_len: usize,
    next_index: u8,
    data: Vec<u8>,
}

impl Pending {
    fn new(timestamp_ns: u64, total_len: usize, first_index: u8, data: Vec<u8>) -> Self {
        Self {
            timestamp_ns,
            total_len,
            next_index: first_index,
            data,
        }
    }

    fn is_complete(&self) -> bool {
        self.data.len() >= self.total_len
    }

    fn into_payload(mut self) -> Vec<u8> {
        self.data.truncate(self.total_len);
        self.data
    }
}

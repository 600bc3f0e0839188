//! Signal databases and signal decoding
//!
//! This module contains the [`SignalDecoder`] seam used by the decode
//! orchestrator, the DBC-backed implementation of it, and the signal database
//! it reads definitions from.

pub mod database;
pub mod dbc;
pub mod decoder;

use crate::types::{DecodedSample, RawFrameTable, Result};

// Re-export key types for convenience
pub use database::{
    j1939_pgn, ByteOrder, DatabaseStats, MessageDefinition, MultiplexerInfo, SignalDatabase,
    SignalDefinition, ValueType,
};
pub use dbc::{load_dbc_file, parse_dbc};
pub use decoder::DbcSignalDecoder;

/// Converts raw frames into physical signal values
///
/// One call is one decode run. `frames` always shares a single payload
/// length; the returned samples may be in any order.
pub trait SignalDecoder: Send + Sync {
    fn decode(&self, database: &SignalDatabase, frames: &RawFrameTable) -> Result<Vec<DecodedSample>>;
}

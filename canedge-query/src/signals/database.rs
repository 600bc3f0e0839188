//! Signal database
//!
//! Holds the message and signal definitions of one decoding database (one DBC
//! file) together with its protocol tag.

use crate::types::{Protocol, ID_MASK};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// A CAN/LIN message definition
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// Message ID as written in the database (bit 31 flags extended IDs)
    pub id: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
    /// True if this message has multiplexed signals
    pub is_multiplexed: bool,
    /// Multiplexer signal name (if multiplexed)
    pub multiplexer_signal: Option<String>,
}

impl MessageDefinition {
    /// Frame identifier without the extended flag
    pub fn frame_id(&self) -> u32 {
        self.id & ID_MASK
    }
}

/// A signal definition
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit in the frame (DBC numbering)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Value table for enum-like values (raw_value -> description)
    pub value_table: Option<HashMap<i64, String>>,
    /// Multiplexer info (None if not multiplexed)
    pub multiplexer_info: Option<MultiplexerInfo>,
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Signed,
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

/// Parameter group number of a 29-bit J1939 identifier
///
/// PDU1 format (PF < 240) addresses a destination in the PS byte, which is
/// not part of the PGN.
pub fn j1939_pgn(id: u32) -> u32 {
    let pgn = (id >> 8) & 0x3_FFFF;
    let pdu_format = (pgn >> 8) & 0xFF;
    if pdu_format < 240 {
        pgn & 0x3_FF00
    } else {
        pgn
    }
}

/// The signal definitions of one decoding database
pub struct SignalDatabase {
    protocol: Protocol,

    /// Message definitions by frame ID (extended flag stripped)
    messages: HashMap<u32, MessageDefinition>,

    /// Frame ID lookup by PGN (J1939 databases only)
    pgn_lookup: HashMap<u32, u32>,
}

impl SignalDatabase {
    /// Create a new empty signal database
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            messages: HashMap::new(),
            pgn_lookup: HashMap::new(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Add a message definition to the database
    ///
    /// A later definition with the same frame ID replaces the earlier one.
    pub fn add_message(&mut self, message: MessageDefinition) {
        let frame_id = message.frame_id();
        if self.protocol == Protocol::J1939 {
            self.pgn_lookup.insert(j1939_pgn(frame_id), frame_id);
        }
        if let Some(previous) = self.messages.insert(frame_id, message) {
            log::warn!(
                "Message {} (ID 0x{:X}) redefined, keeping the last definition",
                previous.name,
                frame_id
            );
        }
    }

    /// Look up the message a frame belongs to
    ///
    /// J1939 databases match on PGN so that any priority and source address
    /// decode with the same definition.
    pub fn find_message(&self, frame_id: u32) -> Option<&MessageDefinition> {
        let frame_id = frame_id & ID_MASK;
        match self.protocol {
            Protocol::Generic => self.messages.get(&frame_id),
            Protocol::J1939 => self
                .messages
                .get(&frame_id)
                .or_else(|| {
                    self.pgn_lookup
                        .get(&j1939_pgn(frame_id))
                        .and_then(|id| self.messages.get(id))
                }),
        }
    }

    /// All frame IDs defined in the database (extended flag stripped)
    pub fn frame_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.messages.keys().copied()
    }

    /// True if any message defines a signal with this name
    pub fn contains_signal(&self, signal_name: &str) -> bool {
        self.messages
            .values()
            .any(|msg| msg.signals.iter().any(|s| s.name == signal_name))
    }

    /// Sorted, de-duplicated list of all signal names
    pub fn signal_names(&self) -> Vec<String> {
        self.messages
            .values()
            .flat_map(|msg| msg.signals.iter().map(|s| s.name.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|msg| msg.signals.len()).sum(),
        }
    }
}

impl fmt::Debug for SignalDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalDatabase")
            .field("protocol", &self.protocol)
            .field("messages", &self.messages.len())
            .finish()
    }
}

impl Default for SignalDatabase {
    fn default() -> Self {
        Self::new(Protocol::Generic)
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}

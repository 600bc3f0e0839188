//! DBC signal decoder
//!
//! Extracts physical signal values from raw frames based on the definitions in
//! a [`SignalDatabase`]. Handles bit extraction, endianness, sign extension,
//! multiplexing and scaling.

use crate::signals::database::{ByteOrder, MessageDefinition, SignalDatabase, SignalDefinition, ValueType};
use crate::config::EngineConfig;
use crate::signals::SignalDecoder;
use crate::types::{DecodedSample, QueryError, RawFrame, RawFrameTable, Result, SampleValue};

/// Signal decoder backed by DBC definitions
#[derive(Debug, Clone, Copy, Default)]
pub struct DbcSignalDecoder {
    value_descriptions: bool,
}

impl DbcSignalDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder configured from the engine settings
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new().with_value_descriptions(config.value_descriptions)
    }

    /// Builder method: emit value-table descriptions as text instead of numbers
    pub fn with_value_descriptions(mut self, enabled: bool) -> Self {
        self.value_descriptions = enabled;
        self
    }

    /// Decode every active signal of one frame
    fn decode_frame(&self, frame: &RawFrame, message_def: &MessageDefinition, out: &mut Vec<DecodedSample>) {
        let mut multiplexer_value: Option<u64> = None;

        // For multiplexed messages, first extract the multiplexer signal value
        if message_def.is_multiplexed {
            if let Some(ref mux_signal_name) = message_def.multiplexer_signal {
                if let Some(mux_signal) = message_def.signals.iter().find(|s| s.name == *mux_signal_name) {
                    if let Some(value) = extract_signal_value(&frame.data, mux_signal) {
                        multiplexer_value = Some(value as u64);
                    }
                }
            }
        }

        for signal in &message_def.signals {
            if let Some(ref mux_info) = signal.multiplexer_info {
                match multiplexer_value {
                    Some(current) if mux_info.multiplexer_values.contains(&current) => {}
                    _ => continue,
                }
            }

            let Some(raw_value) = extract_signal_value(&frame.data, signal) else {
                continue;
            };

            out.push(DecodedSample {
                timestamp_ns: frame.timestamp_ns,
                can_id: frame.id,
                signal: signal.name.clone(),
                raw_value,
                value: self.physical_value(signal, raw_value),
            });
        }
    }

    fn physical_value(&self, signal: &SignalDefinition, raw_value: i64) -> SampleValue {
        if self.value_descriptions {
            if let Some(text) = signal.value_table.as_ref().and_then(|t| t.get(&raw_value)) {
                return SampleValue::Text(text.clone());
            }
        }
        SampleValue::Number(signal.offset + signal.factor * raw_value as f64)
    }
}

impl SignalDecoder for DbcSignalDecoder {
    fn decode(&self, database: &SignalDatabase, frames: &RawFrameTable) -> Result<Vec<DecodedSample>> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }
        let Some(length) = frames.uniform_length() else {
            return Err(QueryError::Decode(
                "frame table mixes payload lengths".to_string(),
            ));
        };

        let mut samples = Vec::new();
        let mut unknown = 0usize;
        for frame in frames.iter() {
            match database.find_message(frame.id) {
                Some(message_def) => self.decode_frame(frame, message_def, &mut samples),
                None => unknown += 1,
            }
        }

        log::trace!(
            "Decoded {} samples from {} frames of {} bytes ({} without definition)",
            samples.len(),
            frames.len(),
            length,
            unknown
        );
        Ok(samples)
    }
}

/// Extract the raw (sign-extended) value of a signal from frame data
///
/// Returns `None` if the signal does not fit in the payload.
fn extract_signal_value(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
    let start_bit = signal.start_bit as usize;
    let length = signal.length as usize;
    if length == 0 || length > 64 {
        return None;
    }

    let raw_value = match signal.byte_order {
        ByteOrder::LittleEndian => {
            if (start_bit + length).div_ceil(8) > data.len() {
                return None;
            }
            extract_little_endian(data, start_bit, length)
        }
        ByteOrder::BigEndian => extract_big_endian(data, start_bit, length)?,
    };

    Some(match signal.value_type {
        ValueType::Unsigned => raw_value as i64,
        ValueType::Signed => sign_extend(raw_value, length),
    })
}

/// Little-endian (Intel): start bit is the LSB, bits grow towards higher bit numbers
fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;

    for i in 0..length {
        let bit_pos = start_bit + i;
        let bit_value = (data[bit_pos / 8] >> (bit_pos % 8)) & 0x01;
        result |= (bit_value as u64) << i;
    }

    result
}

/// Big-endian (Motorola): start bit is the MSB in DBC sawtooth numbering
///
/// Within a byte bits run from 7 down to 0, then continue at bit 7 of the
/// next byte.
fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut bit_pos = start_bit;

    for i in 0..length {
        let byte = *data.get(bit_pos / 8)?;
        let bit_value = (byte >> (bit_pos % 8)) & 0x01;
        result = (result << 1) | bit_value as u64;

        if i + 1 < length {
            bit_pos = if bit_pos % 8 == 0 { bit_pos + 15 } else { bit_pos - 1 };
        }
    }

    Some(result)
}

/// Sign-extend a value from N bits to 64 bits
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}

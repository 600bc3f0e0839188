//! Decode orchestrator
//!
//! Turns the raw frames of one loaded file into physical samples for one
//! decode group: channel and time selection, identifier pre-filter, optional
//! transport reassembly, then one decode run per payload length.

use crate::formats::ParsedLogFile;
use crate::planner::DecodeGroup;
use crate::signals::SignalDecoder;
use crate::transport::MultiFrameReassembler;
use crate::types::{PhysicalSample, Protocol, Result, ID_MASK};
use std::collections::HashSet;

/// Runs decode groups against loaded files
pub struct DecodeOrchestrator<'a> {
    decoder: &'a dyn SignalDecoder,
    reassembler: Option<&'a dyn MultiFrameReassembler>,
}

impl<'a> DecodeOrchestrator<'a> {
    pub fn new(decoder: &'a dyn SignalDecoder, reassembler: Option<&'a dyn MultiFrameReassembler>) -> Self {
        Self { decoder, reassembler }
    }

    /// Samples of the group's requested signals within `[start_ns, stop_ns]`
    ///
    /// Ordered by timestamp. A failing payload-length partition is logged and
    /// skipped; a reassembly failure yields no samples for the group.
    pub fn decode_group(
        &self,
        parsed: &ParsedLogFile,
        group: &DecodeGroup,
        start_ns: u64,
        stop_ns: u64,
        file_label: &str,
    ) -> Vec<PhysicalSample> {
        match self.try_decode_group(parsed, group, start_ns, stop_ns, file_label) {
            Ok(samples) => {
                log::debug!(
                    "File: {} - {} CH{} {}: {} samples",
                    file_label,
                    group.key.interface,
                    group.key.channel,
                    group.key.database,
                    samples.len()
                );
                samples
            }
            Err(e) => {
                log::warn!(
                    "File: {} - failed to decode {} CH{} with {}: {}",
                    file_label,
                    group.key.interface,
                    group.key.channel,
                    group.key.database,
                    e
                );
                Vec::new()
            }
        }
    }

    fn try_decode_group(
        &self,
        parsed: &ParsedLogFile,
        group: &DecodeGroup,
        start_ns: u64,
        stop_ns: u64,
        file_label: &str,
    ) -> Result<Vec<PhysicalSample>> {
        let mut frames = parsed
            .table(group.key.interface)
            .select(group.key.channel, start_ns, stop_ns);
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        let database = group.database.as_ref();
        // J1939 identifiers carry priority and source address; matching happens on the PGN
        if database.protocol() != Protocol::J1939 {
            let known: HashSet<u32> = database.frame_ids().collect();
            frames.retain(|f| known.contains(&(f.id & ID_MASK)));
            if frames.is_empty() {
                return Ok(Vec::new());
            }
        }

        if let Some(reassembler) = self.reassembler {
            frames = reassembler.combine(frames)?;
        }

        let wanted: HashSet<&str> = group.signal_names().into_iter().collect();
        let mut samples = Vec::new();
        for (length, partition) in frames.partition_by_length() {
            let decoded = match self.decoder.decode(database, &partition) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::warn!(
                        "File: {} - skipping {} frames of {} bytes on CH{}: {}",
                        file_label,
                        partition.len(),
                        length,
                        group.key.channel,
                        e
                    );
                    continue;
                }
            };
            log::trace!("{} frames of {} bytes: {} values", partition.len(), length, decoded.len());
            samples.extend(
                decoded
                    .into_iter()
                    .filter(|s| wanted.contains(s.signal.as_str()))
                    .map(PhysicalSample::from),
            );
        }

        samples.sort_by_key(|s| s.timestamp_ns);
        Ok(samples)
    }
}

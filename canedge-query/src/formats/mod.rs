//! Log file frame decoders
//!
//! A frame decoder turns the byte stream of one log file into per-interface
//! raw frame tables. The engine only talks to the [`FrameDecoder`] trait.

use crate::types::{Interface, LogFileMetadata, RawFrameTable, Result};
use std::io::Read;

pub mod csv;

pub use self::csv::CsvFrameDecoder;

/// Frame tables of one log file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLogFile {
    /// First measurement in nanoseconds since epoch
    pub start_ns: Option<u64>,
    pub can: RawFrameTable,
    pub lin: RawFrameTable,
    pub metadata: LogFileMetadata,
}

impl ParsedLogFile {
    pub fn table(&self, interface: Interface) -> &RawFrameTable {
        match interface {
            Interface::Can => &self.can,
            Interface::Lin => &self.lin,
        }
    }

    /// True if any table has a row within `[start_ns, stop_ns]`
    pub fn has_rows_in(&self, start_ns: u64, stop_ns: u64) -> bool {
        self.can.has_rows_in(start_ns, stop_ns) || self.lin.has_rows_in(start_ns, stop_ns)
    }
}

/// Parses log files into raw frame tables
pub trait FrameDecoder: Send + Sync {
    /// Parse a log file, loading only the requested interfaces
    fn parse(
        &self,
        reader: &mut dyn Read,
        interfaces: &[Interface],
        password: Option<&str>,
    ) -> Result<ParsedLogFile>;

    /// Timestamp of the first measurement, used for time-range file selection
    ///
    /// Must agree with [`ParsedLogFile::start_ns`] of a full parse.
    fn first_timestamp(&self, reader: &mut dyn Read, password: Option<&str>) -> Result<Option<u64>> {
        Ok(self.parse(reader, &Interface::ALL, password)?.start_ns)
    }

    /// Header information of a log file
    fn metadata(&self, reader: &mut dyn Read, password: Option<&str>) -> Result<LogFileMetadata> {
        Ok(self.parse(reader, &[], password)?.metadata)
    }
}

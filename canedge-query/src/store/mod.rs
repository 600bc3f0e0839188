//! Log file archives
//!
//! The engine reads archives through the [`LogStore`] trait. [`FsLogStore`]
//! serves a CANedge-style directory tree on the local file system.

use crate::types::{LogFileRef, Result, Timestamp};
use std::io::Read;

pub mod fs;

pub use fs::{parse_log_path, FsLogStore, LogPathParts};

/// Lists, sizes and opens the log files of device archives
pub trait LogStore: Send + Sync {
    /// Log files of `device` that may hold data within `[start, stop]`,
    /// ordered by (session, split)
    fn list_log_files(&self, device: &str, start: &Timestamp, stop: &Timestamp) -> Result<Vec<LogFileRef>>;

    /// Open a log file for reading
    fn open(&self, file: &LogFileRef) -> Result<Box<dyn Read + Send>>;

    /// Size of a log file in bytes
    fn size(&self, file: &LogFileRef) -> Result<u64> {
        Ok(file.size)
    }
}

//! Core types for the time-series query engine
//!
//! This module defines the request, archive, frame, sample and result types that
//! flow between the planner, the log walker, the decode orchestrator, the
//! resampler and the result aggregator.

use crate::signals::SignalDatabase;
use chrono::{DateTime, Utc};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Timestamp type used throughout the engine
pub type Timestamp = DateTime<Utc>;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, QueryError>;

/// Bit set in DBC message identifiers to flag 29-bit (extended) frames
pub const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Mask that strips the extended flag from a DBC message identifier
pub const ID_MASK: u32 = 0x7FFF_FFFF;

/// Convert a timestamp to nanoseconds since epoch
///
/// Pre-epoch times clamp to zero and times beyond the `u64` range clamp to `u64::MAX`.
pub fn timestamp_to_ns(timestamp: &Timestamp) -> u64 {
    let secs = timestamp.timestamp();
    if secs < 0 {
        return 0;
    }
    (secs as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(u64::from(timestamp.timestamp_subsec_nanos()))
}

/// Convert nanoseconds since epoch to a timestamp
pub fn ns_to_timestamp(timestamp_ns: u64) -> Timestamp {
    let secs = (timestamp_ns / 1_000_000_000) as i64;
    let nsecs = (timestamp_ns % 1_000_000_000) as u32;
    DateTime::from_timestamp(secs, nsecs).unwrap_or_default()
}

/// Convert nanoseconds since epoch to fractional epoch milliseconds
pub fn ns_to_epoch_ms(timestamp_ns: u64) -> f64 {
    timestamp_ns as f64 / 1_000_000.0
}

/// Errors raised by the query engine and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Malformed target: {0}")]
    MalformedTarget(String),

    #[error("Unknown {field} value: {value:?}")]
    UnknownVariant { field: &'static str, value: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Unknown database: {0:?}")]
    UnknownDatabase(String),

    #[error("Duplicate target label: {0}")]
    DuplicateTarget(String),

    #[error("Another query is in progress, retry later")]
    Busy,

    #[error("Log store error: {0}")]
    Store(String),

    #[error("Failed to parse log file: {0}")]
    LogParse(String),

    #[error("Failed to parse DBC file: {0}")]
    DbcParse(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Multi-frame reassembly failed: {0}")]
    Reassembly(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Bus interface of a frame table or signal query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Interface {
    Can,
    Lin,
}

impl Interface {
    /// All interfaces, in display order
    pub const ALL: [Interface; 2] = [Interface::Can, Interface::Lin];
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interface::Can => write!(f, "CAN"),
            Interface::Lin => write!(f, "LIN"),
        }
    }
}

impl FromStr for Interface {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CAN" => Ok(Interface::Can),
            "LIN" => Ok(Interface::Lin),
            _ => Err(QueryError::UnknownVariant {
                field: "itf",
                value: s.to_string(),
            }),
        }
    }
}

/// How one sample is picked from each resampling window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SampleMethod {
    /// Sample closest to the window start
    #[default]
    Nearest,
    /// Sample with the largest value in the window
    Max,
    /// Sample with the smallest value in the window
    Min,
}

impl SampleMethod {
    /// All methods, in display order
    pub const ALL: [SampleMethod; 3] = [SampleMethod::Nearest, SampleMethod::Max, SampleMethod::Min];
}

impl fmt::Display for SampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleMethod::Nearest => write!(f, "NEAREST"),
            SampleMethod::Max => write!(f, "MAX"),
            SampleMethod::Min => write!(f, "MIN"),
        }
    }
}

impl FromStr for SampleMethod {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEAREST" => Ok(SampleMethod::Nearest),
            "MAX" => Ok(SampleMethod::Max),
            "MIN" => Ok(SampleMethod::Min),
            _ => Err(QueryError::UnknownVariant {
                field: "method",
                value: s.to_string(),
            }),
        }
    }
}

/// Protocol tag of a decoding database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Frame-identifier addressed CAN/LIN matrix
    #[default]
    Generic,
    /// SAE J1939, where 29-bit identifiers carry priority and source address
    J1939,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Generic => write!(f, "Generic"),
            Protocol::J1939 => write!(f, "J1939"),
        }
    }
}

/// Named reference to a decoding database
///
/// The reference is unresolved when the request named a database that is not
/// loaded. Identity (for grouping) is the database name.
#[derive(Clone)]
pub struct DatabaseRef {
    name: String,
    database: Option<Arc<SignalDatabase>>,
}

impl DatabaseRef {
    /// Reference to a loaded database
    pub fn new(name: impl Into<String>, database: Arc<SignalDatabase>) -> Self {
        Self {
            name: name.into(),
            database: Some(database),
        }
    }

    /// Reference to a database that could not be found
    pub fn unresolved(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> Option<&Arc<SignalDatabase>> {
        self.database.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.database.is_some()
    }

    /// Protocol of the referenced database (generic when unresolved)
    pub fn protocol(&self) -> Protocol {
        self.database
            .as_ref()
            .map(|db| db.protocol())
            .unwrap_or_default()
    }
}

impl fmt::Debug for DatabaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseRef")
            .field("name", &self.name)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl PartialEq for DatabaseRef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for DatabaseRef {}

/// One requested signal time series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalQuery {
    /// Opaque request identifier (echoed back as `refId`)
    pub ref_id: String,
    /// Target label used to correlate the response
    pub target: String,
    /// Device identifier (8 hex digits for CANedge devices)
    pub device: String,
    /// Bus interface
    pub interface: Interface,
    /// Bus channel (1-based)
    pub channel: u8,
    /// Decoding database
    pub database: DatabaseRef,
    /// Signal name as defined in the database
    pub signal: String,
    /// Resampling interval in milliseconds
    pub interval_ms: u64,
    /// Resampling method
    pub method: SampleMethod,
}

impl SignalQuery {
    /// Check the fields the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(QueryError::MissingField("device"));
        }
        if self.signal.trim().is_empty() {
            return Err(QueryError::MissingField("signal"));
        }
        if self.channel == 0 {
            return Err(QueryError::InvalidField {
                field: "chn",
                reason: "channel numbers start at 1".to_string(),
            });
        }
        if self.interval_ms == 0 {
            return Err(QueryError::InvalidField {
                field: "intervalMs",
                reason: "interval must be positive".to_string(),
            });
        }
        if self.database.name().is_empty() {
            return Err(QueryError::MissingField("db"));
        }
        if !self.database.is_resolved() {
            return Err(QueryError::UnknownDatabase(self.database.name().to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for SignalQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, CH{}, {}, {}, {}, {}",
            self.ref_id,
            self.target,
            self.device,
            self.interface,
            self.channel,
            self.database.name(),
            self.signal,
            self.interval_ms,
            self.method
        )
    }
}

/// Reference to one log file in a device archive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogFileRef {
    pub device: String,
    pub session: u32,
    pub split: u32,
    /// File size in bytes
    pub size: u64,
    /// Store-relative path
    pub path: String,
}

/// Raw bus frame as yielded by the frame decoder
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Timestamp in nanoseconds since epoch
    pub timestamp_ns: u64,
    /// Bus channel number (1-based)
    pub channel: u8,
    /// Frame identifier (11-bit, 29-bit or LIN 6-bit)
    pub id: u32,
    /// True if this is an extended (29-bit) CAN ID; always false for LIN
    pub is_extended: bool,
    /// Payload bytes
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn timestamp(&self) -> Timestamp {
        ns_to_timestamp(self.timestamp_ns)
    }

    /// Payload length in bytes
    pub fn data_length(&self) -> usize {
        self.data.len()
    }
}

/// Frames of one interface of one log file, ordered by timestamp
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFrameTable {
    frames: Vec<RawFrame>,
}

impl RawFrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table, ordering rows by timestamp (stable for equal timestamps)
    pub fn from_frames(mut frames: Vec<RawFrame>) -> Self {
        frames.sort_by_key(|f| f.timestamp_ns);
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[RawFrame] {
        &self.frames
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RawFrame> {
        self.frames.iter()
    }

    pub fn into_frames(self) -> Vec<RawFrame> {
        self.frames
    }

    /// True if any row falls within `[start_ns, stop_ns]`
    pub fn has_rows_in(&self, start_ns: u64, stop_ns: u64) -> bool {
        let first = self.frames.partition_point(|f| f.timestamp_ns < start_ns);
        self.frames
            .get(first)
            .map_or(false, |f| f.timestamp_ns <= stop_ns)
    }

    /// All rows within `[start_ns, stop_ns]`
    pub fn window(&self, start_ns: u64, stop_ns: u64) -> &[RawFrame] {
        let first = self.frames.partition_point(|f| f.timestamp_ns < start_ns);
        let last = self.frames.partition_point(|f| f.timestamp_ns <= stop_ns).max(first);
        &self.frames[first..last]
    }

    /// Rows on `channel` within `[start_ns, stop_ns]`
    pub fn select(&self, channel: u8, start_ns: u64, stop_ns: u64) -> RawFrameTable {
        let first = self.frames.partition_point(|f| f.timestamp_ns < start_ns);
        let frames = self.frames[first..]
            .iter()
            .take_while(|f| f.timestamp_ns <= stop_ns)
            .filter(|f| f.channel == channel)
            .cloned()
            .collect();
        Self { frames }
    }

    /// Keep only rows accepted by `keep`
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&RawFrame) -> bool,
    {
        self.frames.retain(keep);
    }

    /// Split rows into tables of uniform payload length, ordered by length
    pub fn partition_by_length(self) -> BTreeMap<usize, RawFrameTable> {
        let mut partitions: BTreeMap<usize, RawFrameTable> = BTreeMap::new();
        for frame in self.frames {
            partitions
                .entry(frame.data_length())
                .or_default()
                .frames
                .push(frame);
        }
        partitions
    }

    /// Payload length shared by every row, if uniform
    pub fn uniform_length(&self) -> Option<usize> {
        let first = self.frames.first()?.data_length();
        self.frames
            .iter()
            .all(|f| f.data_length() == first)
            .then_some(first)
    }
}

impl FromIterator<RawFrame> for RawFrameTable {
    fn from_iter<T: IntoIterator<Item = RawFrame>>(iter: T) -> Self {
        Self::from_frames(iter.into_iter().collect())
    }
}

/// Physical signal value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    /// Scaled numeric value
    Number(f64),
    /// Value-table text
    Text(String),
}

impl SampleValue {
    /// True for values that must not reach the output (NaN)
    pub fn is_missing(&self) -> bool {
        match self {
            SampleValue::Number(v) => v.is_nan(),
            SampleValue::Text(_) => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SampleValue::Number(v) => Some(*v),
            SampleValue::Text(_) => None,
        }
    }

    /// Total order used by MIN/MAX selection: numbers before text
    pub fn total_cmp(&self, other: &SampleValue) -> Ordering {
        match (self, other) {
            (SampleValue::Number(a), SampleValue::Number(b)) => a.total_cmp(b),
            (SampleValue::Text(a), SampleValue::Text(b)) => a.cmp(b),
            (SampleValue::Number(_), SampleValue::Text(_)) => Ordering::Less,
            (SampleValue::Text(_), SampleValue::Number(_)) => Ordering::Greater,
        }
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Number(v) => write!(f, "{}", v),
            SampleValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Decoder output row, before decoder-internal columns are dropped
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    pub timestamp_ns: u64,
    /// Identifier of the frame the value came from
    pub can_id: u32,
    pub signal: String,
    /// Raw value before scaling
    pub raw_value: i64,
    pub value: SampleValue,
}

/// Physical value of one signal at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalSample {
    pub timestamp_ns: u64,
    pub signal: String,
    pub value: SampleValue,
}

impl From<DecodedSample> for PhysicalSample {
    fn from(sample: DecodedSample) -> Self {
        Self {
            timestamp_ns: sample.timestamp_ns,
            signal: sample.signal,
            value: sample.value,
        }
    }
}

/// One output point, serialized as `[value, epoch_ms]`
///
/// A point with both fields empty is a gap marker.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesPoint {
    pub value: Option<SampleValue>,
    pub timestamp_ms: Option<f64>,
}

impl TimeSeriesPoint {
    pub fn new(value: SampleValue, timestamp_ns: u64) -> Self {
        Self {
            value: Some(value),
            timestamp_ms: Some(ns_to_epoch_ms(timestamp_ns)),
        }
    }

    pub fn gap() -> Self {
        Self {
            value: None,
            timestamp_ms: None,
        }
    }

    pub fn is_gap(&self) -> bool {
        self.value.is_none() && self.timestamp_ms.is_none()
    }
}

impl Serialize for TimeSeriesPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.value)?;
        tuple.serialize_element(&self.timestamp_ms)?;
        tuple.end()
    }
}

/// Time series answer for one signal query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesResult {
    #[serde(rename = "refId")]
    pub ref_id: String,
    pub target: String,
    pub datapoints: Vec<TimeSeriesPoint>,
}

impl TimeSeriesResult {
    pub fn empty(ref_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            target: target.into(),
            datapoints: Vec::new(),
        }
    }

    /// Number of gap markers in the series
    pub fn gap_count(&self) -> usize {
        self.datapoints.iter().filter(|p| p.is_gap()).count()
    }
}

/// Device and file information recorded in a log file header
///
/// Every field is optional: exports and older firmware omit some or all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileMetadata {
    /// Configuration file checksum (CRC32, as written by the device)
    pub config_crc: Option<String>,
    pub hw_version: Option<String>,
    pub fw_version: Option<String>,
    /// Free storage in kB
    pub storage_free_kb: Option<u64>,
    /// Total storage in kB
    pub storage_total_kb: Option<u64>,
    pub comment: Option<String>,
}

impl LogFileMetadata {
    /// Used and total storage in MB, if both figures are known
    pub fn storage_mb(&self) -> Option<(u64, u64)> {
        let total = self.storage_total_kb?;
        let free = self.storage_free_kb?;
        Some((total.saturating_sub(free) >> 10, total >> 10))
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Summary row describing one log file of an archive
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogFileInfo {
    /// First measurement, epoch milliseconds
    pub start_ms: Option<f64>,
    pub device: String,
    pub session: u32,
    pub split: u32,
    /// File size in whole megabytes
    pub size_mb: u64,
    pub path: String,
    #[serde(flatten)]
    pub metadata: LogFileMetadata,
}

/// Which log file boundaries to annotate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    /// First split of every session
    Session,
    /// Every split file
    Split,
}

impl fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationKind::Session => write!(f, "session"),
            AnnotationKind::Split => write!(f, "split"),
        }
    }
}

impl FromStr for AnnotationKind {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(AnnotationKind::Session),
            "split" => Ok(AnnotationKind::Split),
            _ => Err(QueryError::UnknownVariant {
                field: "annotation",
                value: s.to_string(),
            }),
        }
    }
}

/// Time marker at the start of a log file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    /// Epoch milliseconds
    pub time: f64,
    pub text: String,
}

/// One raw frame of the data table view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawFrameRow {
    /// Epoch milliseconds
    #[serde(rename = "TIME")]
    pub time_ms: f64,
    #[serde(rename = "ITF")]
    pub interface: Interface,
    #[serde(rename = "CHN")]
    pub channel: u8,
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "IDE")]
    pub is_extended: bool,
    /// Payload length in bytes
    #[serde(rename = "NOB")]
    pub length: usize,
    /// Payload as space separated hex bytes
    #[serde(rename = "DATA")]
    pub data: String,
}

impl RawFrameRow {
    pub fn new(interface: Interface, frame: &RawFrame) -> Self {
        Self {
            time_ms: ns_to_epoch_ms(frame.timestamp_ns),
            interface,
            channel: frame.channel,
            id: frame.id,
            is_extended: frame.is_extended,
            length: frame.data_length(),
            data: frame
                .data
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

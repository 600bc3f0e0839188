//! CANedge Time-Series Query Library
//!
//! Answers time-windowed signal queries against archives of CANedge bus-log
//! files, returning one chartable time series per requested signal.
//!
//! # Architecture
//!
//! A request flows through five stages:
//! - The planner groups signal queries by device, then by (interface,
//!   channel, database), so each file is loaded once and decoded once per group
//! - The log walker visits a device's files in (session, split) order under a
//!   data-volume budget shared by the whole request
//! - The decode orchestrator filters raw frames, optionally reassembles
//!   transport protocol messages, and decodes one payload length at a time
//! - The resampler keeps at most one real sample per time window
//! - The result aggregator collects points per target and marks session
//!   boundaries with `[null, null]` gap points
//!
//! Log archives, log file parsing and signal decoding sit behind the
//! [`LogStore`], [`FrameDecoder`] and [`SignalDecoder`] traits.
//!
//! The library does NOT:
//! - Discover devices on its own (see [`FsLogStore::device_ids`])
//! - Persist anything beyond short-lived in-memory caches
//! - Interpolate or upsample
//!
//! # Example Usage
//!
//! ```no_run
//! use canedge_query::{
//!     parse_query_request, CsvFrameDecoder, DatabaseRegistry, DbcSignalDecoder, EngineConfig,
//!     FsLogStore, QueryEngine,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! // Load decoding databases and open the archive
//! let registry = DatabaseRegistry::load_dir(Path::new("LOG")).unwrap();
//! let frames = Arc::new(CsvFrameDecoder::new());
//! let store = FsLogStore::new("LOG").with_start_times(frames.clone());
//!
//! let config = EngineConfig::new().with_limit_mb(50).with_value_descriptions(true);
//! let engine = QueryEngine::new(
//!     Arc::new(store),
//!     frames,
//!     Arc::new(DbcSignalDecoder::from_config(&config)),
//!     config,
//! );
//!
//! let body = std::fs::read_to_string("request.json").unwrap();
//! let request = parse_query_request(&body, &registry).unwrap();
//! for series in engine.query(&request.queries, &request.start, &request.stop).unwrap() {
//!     println!("{}: {} points", series.target, series.datapoints.len());
//! }
//! ```

// Public modules
pub mod admission;
pub mod aggregate;
pub mod cache;
pub mod config;
pub mod engine;
pub mod formats;
pub mod orchestrator;
pub mod planner;
pub mod request;
pub mod resample;
pub mod signals;
pub mod store;
pub mod transport;
pub mod types;
pub mod walker;

// Re-export main types for convenience
pub use admission::{AdmissionGate, AdmissionPermit};
pub use aggregate::ResultAggregator;
pub use cache::{fingerprint, TtlCache};
pub use config::{BudgetPolicy, EngineConfig, TransportProtocol};
pub use engine::QueryEngine;
pub use formats::{CsvFrameDecoder, FrameDecoder, ParsedLogFile};
pub use orchestrator::DecodeOrchestrator;
pub use planner::{plan, DecodeGroup, DecodeKey, DeviceGroup, PlannedQuery, QueryPlan, RejectedQuery, TargetSlot};
pub use request::{parse_query_request, parse_target, DatabaseRegistry, ParsedRequest, RejectedTarget, TargetSpec};
pub use resample::resample;
pub use signals::{load_dbc_file, parse_dbc, DbcSignalDecoder, SignalDatabase, SignalDecoder};
pub use store::{FsLogStore, LogStore};
pub use transport::{reassembler_for, MultiFrameReassembler};
pub use types::{
    Annotation, AnnotationKind, DatabaseRef, DecodedSample, Interface, LogFileInfo, LogFileMetadata, LogFileRef,
    PhysicalSample, Protocol, QueryError, RawFrame, RawFrameRow, RawFrameTable, Result, SampleMethod, SampleValue,
    SignalQuery, TimeSeriesPoint, TimeSeriesResult, Timestamp,
};
pub use walker::{LogWalker, VolumeBudget, WalkStep};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

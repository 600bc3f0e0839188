//! Query engine API
//!
//! [`QueryEngine`] is the entry point of the library. It ties the log store,
//! the frame and signal decoders and the optional transport reassembler
//! together and answers signal queries with one time series per query.

use crate::admission::AdmissionGate;
use crate::aggregate::ResultAggregator;
use crate::cache::{fingerprint, TtlCache};
use crate::config::{BudgetPolicy, EngineConfig, TransportProtocol};
use crate::formats::{FrameDecoder, ParsedLogFile};
use crate::orchestrator::DecodeOrchestrator;
use crate::planner::{plan, QueryPlan};
use crate::resample::resample;
use crate::signals::SignalDecoder;
use crate::store::LogStore;
use crate::transport::{reassembler_for, MultiFrameReassembler};
use crate::types::{
    ns_to_epoch_ms, timestamp_to_ns, Annotation, AnnotationKind, Interface, LogFileInfo, LogFileMetadata,
    LogFileRef, RawFrame, RawFrameRow, Result, SampleMethod, SignalQuery, TimeSeriesResult, Timestamp,
};
use crate::walker::{LogWalker, VolumeBudget};
use serde::Serialize;
use std::sync::Arc;

/// Cache key of one parsed log file
#[derive(Serialize)]
struct FileKey<'a> {
    device: &'a str,
    path: &'a str,
    interfaces: &'a [Interface],
    password: Option<&'a str>,
}

#[derive(Serialize)]
struct QueryKey<'a> {
    ref_id: &'a str,
    target: &'a str,
    device: &'a str,
    interface: Interface,
    channel: u8,
    database: &'a str,
    signal: &'a str,
    interval_ms: u64,
    method: SampleMethod,
}

/// Cache key of one whole request
#[derive(Serialize)]
struct RequestKey<'a> {
    queries: Vec<QueryKey<'a>>,
    start_ns: u64,
    stop_ns: u64,
    limit_mb: u64,
    budget_policy: BudgetPolicy,
    transport: TransportProtocol,
}

/// The query engine: entry point for all query operations
pub struct QueryEngine {
    store: Arc<dyn LogStore>,
    frames: Arc<dyn FrameDecoder>,
    signals: Arc<dyn SignalDecoder>,
    reassembler: Option<Box<dyn MultiFrameReassembler>>,
    config: EngineConfig,
    file_cache: TtlCache<ParsedLogFile>,
    request_cache: TtlCache<Vec<TimeSeriesResult>>,
    gate: AdmissionGate,
}

impl QueryEngine {
    /// Create an engine over a log store and decoders
    ///
    /// The transport reassembler is chosen from `config.transport`.
    pub fn new(
        store: Arc<dyn LogStore>,
        frames: Arc<dyn FrameDecoder>,
        signals: Arc<dyn SignalDecoder>,
        config: EngineConfig,
    ) -> Self {
        let ttl = config.cache_ttl();
        Self {
            store,
            frames,
            signals,
            reassembler: reassembler_for(config.transport),
            file_cache: TtlCache::new(ttl, config.cache_capacity),
            request_cache: TtlCache::new(ttl, config.cache_capacity),
            gate: AdmissionGate::new(),
            config,
        }
    }

    /// Builder method: use a custom transport reassembler
    pub fn with_reassembler(mut self, reassembler: Box<dyn MultiFrameReassembler>) -> Self {
        self.reassembler = Some(reassembler);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Answer a batch of signal queries
    ///
    /// Identical requests within the cache TTL are served from cache. Otherwise
    /// the request needs the single admission permit and fails with
    /// [`QueryError::Busy`](crate::QueryError::Busy) while another query runs.
    ///
    /// # Arguments
    /// * `queries` - Signal queries; each gets exactly one result, in order
    /// * `start` / `stop` - Inclusive time window
    ///
    /// # Example
    /// ```no_run
    /// use canedge_query::{CsvFrameDecoder, DbcSignalDecoder, EngineConfig, FsLogStore, QueryEngine};
    /// use std::sync::Arc;
    ///
    /// let engine = QueryEngine::new(
    ///     Arc::new(FsLogStore::new("LOG")),
    ///     Arc::new(CsvFrameDecoder::new()),
    ///     Arc::new(DbcSignalDecoder::new()),
    ///     EngineConfig::default(),
    /// );
    /// let now = chrono::Utc::now();
    /// let results = engine.query(&[], &(now - chrono::Duration::hours(1)), &now).unwrap();
    /// assert!(results.is_empty());
    /// ```
    pub fn query(&self, queries: &[SignalQuery], start: &Timestamp, stop: &Timestamp) -> Result<Vec<TimeSeriesResult>> {
        let key = self.request_key(queries, start, stop)?;
        if let Some(cached) = self.request_cache.get(&key) {
            log::debug!("Serving {} queries from cache", queries.len());
            return Ok(cached.as_ref().clone());
        }

        let _permit = self.gate.try_acquire()?;
        let plan = plan(queries);
        let results = self.run(&plan, start, stop, self.config.limit_mb)?;
        self.request_cache.insert(&key, Arc::new(results.clone()));
        Ok(results)
    }

    /// Execute a plan within `[start, stop]` under a data-volume budget
    ///
    /// Log files are loaded one at a time, once per device, and decoded once
    /// per decode group. The budget is shared by all devices of the plan.
    /// Files that fail to load are skipped; failing to list a device's
    /// files fails the run.
    ///
    /// # Returns
    /// One result per plan target, in target order
    pub fn run(
        &self,
        plan: &QueryPlan,
        start: &Timestamp,
        stop: &Timestamp,
        volume_budget_mb: u64,
    ) -> Result<Vec<TimeSeriesResult>> {
        let start_ns = timestamp_to_ns(start);
        let stop_ns = timestamp_to_ns(stop);
        let mut aggregator = ResultAggregator::new(&plan.targets);
        let mut budget = VolumeBudget::new(volume_budget_mb, self.config.budget_policy);
        let orchestrator = DecodeOrchestrator::new(self.signals.as_ref(), self.reassembler.as_deref());

        for device in &plan.devices {
            let interfaces = device.interfaces();
            let slots = device.slots();
            let mut walker = LogWalker::new(self.store.as_ref(), &device.device, start, stop, budget)?;

            for step in walker.by_ref() {
                // A gap stays pending until the slot receives new points
                aggregator.begin_file(step.session_changed, &slots);

                let parsed = match self.load_log_file(&step.file, &interfaces) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        log::warn!("File: {} - unable to load: {}", step.file.path, e);
                        continue;
                    }
                };
                if !parsed.has_rows_in(start_ns, stop_ns) {
                    log::debug!("File: {} - no data in time range", step.file.path);
                    continue;
                }

                for group in &device.decode_groups {
                    let samples = orchestrator.decode_group(&parsed, group, start_ns, stop_ns, &step.file.path);
                    for planned in &group.queries {
                        let query = &planned.query;
                        let signal_samples = samples.iter().filter(|s| s.signal == query.signal);
                        aggregator.append(planned.slot, resample(signal_samples, query.interval_ms, query.method));
                    }
                }
            }

            if !walker.skipped().is_empty() {
                log::info!(
                    "{}: {} files skipped (limit {} MB)",
                    device.device,
                    walker.skipped().len(),
                    volume_budget_mb
                );
            }
            budget = walker.into_budget();
        }

        Ok(aggregator.finish())
    }

    /// Describe the log files of a device within `[start, stop]`
    ///
    /// The start time or header information of a file that cannot be read
    /// is left empty.
    pub fn list_files(&self, device: &str, start: &Timestamp, stop: &Timestamp) -> Result<Vec<LogFileInfo>> {
        let files = self.store.list_log_files(device, start, stop)?;

        let rows = files
            .into_iter()
            .map(|file| {
                let start_ms = self.first_timestamp(&file).map(ns_to_epoch_ms);
                let metadata = self.read_metadata(&file);
                let size = self.store.size(&file).unwrap_or(file.size);
                LogFileInfo {
                    start_ms,
                    device: file.device,
                    session: file.session,
                    split: file.split,
                    size_mb: size >> 20,
                    path: file.path,
                    metadata,
                }
            })
            .collect();
        Ok(rows)
    }

    /// Raw CAN and LIN frames of a device within `[start, stop]`, in time order
    ///
    /// Collection stops once `max_rows` rows are gathered. Files that fail to
    /// load are skipped.
    pub fn raw_frames(
        &self,
        device: &str,
        start: &Timestamp,
        stop: &Timestamp,
        max_rows: usize,
    ) -> Result<Vec<RawFrameRow>> {
        let start_ns = timestamp_to_ns(start);
        let stop_ns = timestamp_to_ns(stop);
        let mut files = self.store.list_log_files(device, start, stop)?;
        files.sort_by_key(|f| (f.session, f.split));

        let mut rows = Vec::new();
        for file in &files {
            if rows.len() >= max_rows {
                break;
            }
            let parsed = match self.load_log_file(file, &Interface::ALL) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("File: {} - unable to load: {}", file.path, e);
                    continue;
                }
            };

            let mut frames: Vec<(Interface, &RawFrame)> = parsed
                .can
                .window(start_ns, stop_ns)
                .iter()
                .map(|f| (Interface::Can, f))
                .chain(parsed.lin.window(start_ns, stop_ns).iter().map(|f| (Interface::Lin, f)))
                .collect();
            // Stable: CAN stays ahead of LIN on equal timestamps
            frames.sort_by_key(|(_, f)| f.timestamp_ns);
            frames.truncate(max_rows - rows.len());
            rows.extend(frames.into_iter().map(|(interface, f)| RawFrameRow::new(interface, f)));
        }

        log::debug!("{}: {} raw frames from {} files", device, rows.len(), files.len());
        Ok(rows)
    }

    /// Time markers at log file starts within `[start, stop]`
    ///
    /// [`AnnotationKind::Session`] marks the first split of each session,
    /// [`AnnotationKind::Split`] marks every file. Files without a readable
    /// start time are skipped.
    pub fn annotations(
        &self,
        device: &str,
        kind: AnnotationKind,
        start: &Timestamp,
        stop: &Timestamp,
    ) -> Result<Vec<Annotation>> {
        let mut files = self.store.list_log_files(device, start, stop)?;
        files.sort_by_key(|f| (f.session, f.split));

        let annotations = files
            .iter()
            .filter(|file| kind == AnnotationKind::Split || file.split == 1)
            .filter_map(|file| {
                let start_ns = self.first_timestamp(file)?;
                let size = self.store.size(file).unwrap_or(file.size);
                Some(Annotation {
                    time: ns_to_epoch_ms(start_ns),
                    text: format!(
                        "{}\nSession: {}\nSplit: {}\nSize: {} MB",
                        file.path,
                        file.session,
                        file.split,
                        size >> 20
                    ),
                })
            })
            .collect();
        Ok(annotations)
    }

    /// First measurement of a file, `None` if it cannot be read
    fn first_timestamp(&self, file: &LogFileRef) -> Option<u64> {
        let password = self.config.password_for(&file.device);
        self.store
            .open(file)
            .and_then(|mut reader| self.frames.first_timestamp(&mut *reader, password))
            .unwrap_or_else(|e| {
                log::warn!("File: {} - unable to read start time: {}", file.path, e);
                None
            })
    }

    /// Header information of a file, empty if it cannot be read
    fn read_metadata(&self, file: &LogFileRef) -> LogFileMetadata {
        let password = self.config.password_for(&file.device);
        self.store
            .open(file)
            .and_then(|mut reader| self.frames.metadata(&mut *reader, password))
            .unwrap_or_else(|e| {
                log::warn!("File: {} - unable to read header: {}", file.path, e);
                LogFileMetadata::default()
            })
    }

    /// Parse a log file for `interfaces`, shared through the file cache
    fn load_log_file(&self, file: &LogFileRef, interfaces: &[Interface]) -> Result<Arc<ParsedLogFile>> {
        let password = self.config.password_for(&file.device);
        let key = fingerprint(&FileKey {
            device: &file.device,
            path: &file.path,
            interfaces,
            password,
        })?;

        self.file_cache.memoize(&key, || {
            let mut reader = self.store.open(file)?;
            self.frames.parse(&mut *reader, interfaces, password)
        })
    }

    fn request_key(&self, queries: &[SignalQuery], start: &Timestamp, stop: &Timestamp) -> Result<String> {
        fingerprint(&RequestKey {
            queries: queries
                .iter()
                .map(|q| QueryKey {
                    ref_id: &q.ref_id,
                    target: &q.target,
                    device: &q.device,
                    interface: q.interface,
                    channel: q.channel,
                    database: q.database.name(),
                    signal: &q.signal,
                    interval_ms: q.interval_ms,
                    method: q.method,
                })
                .collect(),
            start_ns: timestamp_to_ns(start),
            stop_ns: timestamp_to_ns(stop),
            limit_mb: self.config.limit_mb,
            budget_policy: self.config.budget_policy,
            transport: self.config.transport,
        })
    }
}

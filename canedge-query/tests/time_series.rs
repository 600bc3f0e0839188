// End-to-end query scenarios over an in-memory archive of text exports
use canedge_query::{
    parse_dbc, plan, AnnotationKind, CsvFrameDecoder, DatabaseRef, DbcSignalDecoder, DecodedSample, EngineConfig,
    Interface, LogFileRef, LogStore, QueryEngine, QueryError, RawFrameTable, Result, SampleMethod, SignalDatabase,
    SignalDecoder, SignalQuery, TimeSeriesResult, Timestamp,
};
use chrono::{TimeZone, Utc};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

const DEVICE: &str = "AABBCCDD";
const MB: u64 = 1 << 20;

const VEHICLE_DBC: &str = r#"
VERSION ""

NS_ :
    CM_
    VAL_

BS_:

BU_: ECU1

BO_ 256 Vehicle: 8 ECU1
 SG_ Speed : 0|16@1+ (1,0) [0|65535] "km/h" Vector__XXX
 SG_ Rpm : 16|16@1+ (1,0) [0|65535] "rpm" Vector__XXX
"#;

/// Archive held in memory: (file, content) per device
struct MemoryStore {
    files: Vec<(LogFileRef, Vec<u8>)>,
}

impl LogStore for MemoryStore {
    fn list_log_files(&self, device: &str, _start: &Timestamp, _stop: &Timestamp) -> Result<Vec<LogFileRef>> {
        Ok(self
            .files
            .iter()
            .filter(|(file, _)| file.device == device)
            .map(|(file, _)| file.clone())
            .collect())
    }

    fn open(&self, file: &LogFileRef) -> Result<Box<dyn Read + Send>> {
        self.files
            .iter()
            .find(|(f, _)| f == file)
            .map(|(_, content)| Box::new(Cursor::new(content.clone())) as Box<dyn Read + Send>)
            .ok_or_else(|| QueryError::Store(format!("{} not found", file.path)))
    }
}

/// Store that records every file it opens
struct RecordingStore {
    inner: MemoryStore,
    opened: Arc<Mutex<Vec<LogFileRef>>>,
}

impl LogStore for RecordingStore {
    fn list_log_files(&self, device: &str, start: &Timestamp, stop: &Timestamp) -> Result<Vec<LogFileRef>> {
        self.inner.list_log_files(device, start, stop)
    }

    fn open(&self, file: &LogFileRef) -> Result<Box<dyn Read + Send>> {
        self.opened.lock().unwrap().push(file.clone());
        self.inner.open(file)
    }
}

/// Signal decoder that holds its first decode run until released
struct BlockingDecoder {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl SignalDecoder for BlockingDecoder {
    fn decode(&self, database: &SignalDatabase, frames: &RawFrameTable) -> Result<Vec<DecodedSample>> {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv();
        DbcSignalDecoder::new().decode(database, frames)
    }
}

/// Signal decoder that counts decode runs
struct CountingDecoder {
    inner: DbcSignalDecoder,
    runs: Arc<AtomicUsize>,
}

impl SignalDecoder for CountingDecoder {
    fn decode(&self, database: &SignalDatabase, frames: &RawFrameTable) -> Result<Vec<DecodedSample>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(database, frames)
    }
}

/// Text export rows of (epoch seconds, speed, rpm) on CAN channel 1
fn export(rows: &[(f64, u16, u16)]) -> Vec<u8> {
    rows.iter()
        .map(|(secs, speed, rpm)| {
            let [s0, s1] = speed.to_le_bytes();
            let [r0, r1] = rpm.to_le_bytes();
            format!(
                "{:.3};CAN;1;100;0;8;{:02X}{:02X}{:02X}{:02X}00000000\n",
                secs, s0, s1, r0, r1
            )
        })
        .collect::<String>()
        .into_bytes()
}

fn log_file(session: u32, split: u32, size: u64, rows: &[(f64, u16, u16)]) -> (LogFileRef, Vec<u8>) {
    device_file(DEVICE, session, split, size, export(rows))
}

fn device_file(device: &str, session: u32, split: u32, size: u64, content: Vec<u8>) -> (LogFileRef, Vec<u8>) {
    (
        LogFileRef {
            device: device.to_string(),
            session,
            split,
            size,
            path: format!("{}/{:08}/{:08}.CSV", device, session, split),
        },
        content,
    )
}

fn database() -> DatabaseRef {
    DatabaseRef::new("vehicle", Arc::new(parse_dbc(VEHICLE_DBC).unwrap()))
}

fn query(signal: &str, database: &DatabaseRef, method: SampleMethod) -> SignalQuery {
    SignalQuery {
        ref_id: "A".to_string(),
        target: format!("{}:CAN:CH1:{}:{}:{}", DEVICE, database.name(), signal, method),
        device: DEVICE.to_string(),
        interface: Interface::Can,
        channel: 1,
        database: database.clone(),
        signal: signal.to_string(),
        interval_ms: 1000,
        method,
    }
}

fn device_query(device: &str, signal: &str, database: &DatabaseRef) -> SignalQuery {
    let mut query = query(signal, database, SampleMethod::Nearest);
    query.target = query.target.replacen(DEVICE, device, 1);
    query.device = device.to_string();
    query
}

fn engine(files: Vec<(LogFileRef, Vec<u8>)>, config: EngineConfig) -> (QueryEngine, Arc<AtomicUsize>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let runs = Arc::new(AtomicUsize::new(0));
    let decoder = CountingDecoder {
        inner: DbcSignalDecoder::new(),
        runs: Arc::clone(&runs),
    };
    let engine = QueryEngine::new(
        Arc::new(MemoryStore { files }),
        Arc::new(CsvFrameDecoder::new()),
        Arc::new(decoder),
        config,
    );
    (engine, runs)
}

/// Two sessions of two splits each
fn two_sessions() -> Vec<(LogFileRef, Vec<u8>)> {
    vec![
        log_file(1, 1, MB / 4, &[(1000.0, 10, 1000), (1000.5, 11, 1100), (1001.0, 12, 1200)]),
        log_file(1, 2, MB / 4, &[(1002.0, 13, 1300), (1003.0, 14, 1400)]),
        log_file(2, 1, MB / 4, &[(1010.0, 20, 2000), (1010.2, 21, 2100)]),
        log_file(2, 2, MB / 4, &[(1011.0, 22, 2200)]),
    ]
}

fn window() -> (Timestamp, Timestamp) {
    (Utc.timestamp_opt(900, 0).unwrap(), Utc.timestamp_opt(2000, 0).unwrap())
}

fn timestamps(result: &TimeSeriesResult) -> Vec<Option<f64>> {
    result.datapoints.iter().map(|p| p.timestamp_ms).collect()
}

#[test]
fn test_gap_between_sessions() {
    let db = database();
    let (engine, _) = engine(two_sessions(), EngineConfig::default());
    let (start, stop) = window();

    let results = engine
        .query(&[query("Speed", &db, SampleMethod::Nearest)], &start, &stop)
        .unwrap();
    assert_eq!(results.len(), 1);

    let series = &results[0];
    assert_eq!(
        timestamps(series),
        vec![
            Some(1_000_000.0),
            Some(1_001_000.0),
            Some(1_002_000.0),
            Some(1_003_000.0),
            None,
            Some(1_010_000.0),
            Some(1_011_000.0),
        ]
    );
    assert_eq!(series.gap_count(), 1);
    assert!(series.datapoints[4].is_gap());

    let json = serde_json::to_value(series).unwrap();
    assert_eq!(json["refId"], "A");
    assert_eq!(json["datapoints"][0][0], 10.0);
    assert!(json["datapoints"][4][0].is_null());
}

#[test]
fn test_budget_skips_third_file() {
    let files = vec![
        log_file(1, 1, MB / 2, &[(1000.0, 1, 0)]),
        log_file(1, 2, MB / 2, &[(1001.0, 2, 0)]),
        log_file(1, 3, 2 * MB, &[(1002.0, 3, 0)]),
    ];
    let db = database();
    let (engine, _) = engine(files, EngineConfig::default());
    let (start, stop) = window();

    let plan = plan(&[query("Speed", &db, SampleMethod::Nearest)]);
    let results = engine.run(&plan, &start, &stop, 1).unwrap();
    assert_eq!(timestamps(&results[0]), vec![Some(1_000_000.0), Some(1_001_000.0)]);
}

#[test]
fn test_shared_group_decodes_once_per_file() {
    let db = database();
    let (engine, runs) = engine(two_sessions(), EngineConfig::default());
    let (start, stop) = window();

    let queries = [
        query("Speed", &db, SampleMethod::Nearest),
        query("Rpm", &db, SampleMethod::Max),
    ];
    let results = engine.query(&queries, &start, &stop).unwrap();

    // Four files, one payload length each
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(results[1].datapoints.len(), 7);
    let first_rpm = results[1].datapoints[0].value.as_ref().and_then(|v| v.as_f64());
    assert_eq!(first_rpm, Some(1100.0));
}

#[test]
fn test_unknown_database_yields_empty_series() {
    let db = database();
    let missing = DatabaseRef::unresolved("nope");
    let (engine, _) = engine(two_sessions(), EngineConfig::default());
    let (start, stop) = window();

    let queries = [
        query("Speed", &db, SampleMethod::Nearest),
        query("Speed", &missing, SampleMethod::Nearest),
        query("Rpm", &db, SampleMethod::Min),
    ];
    let results = engine.query(&queries, &start, &stop).unwrap();

    let targets: Vec<_> = results.iter().map(|r| r.target.as_str()).collect();
    let expected: Vec<_> = queries.iter().map(|q| q.target.as_str()).collect();
    assert_eq!(targets, expected);
    assert!(results[1].datapoints.is_empty());
    assert_eq!(results[0].datapoints.len(), 7);
    assert_eq!(results[2].datapoints.len(), 7);
}

#[test]
fn test_timestamps_are_real_and_ordered() {
    let db = database();
    let (engine, _) = engine(two_sessions(), EngineConfig::default());
    let (start, stop) = window();

    let results = engine
        .query(&[query("Speed", &db, SampleMethod::Max)], &start, &stop)
        .unwrap();
    let emitted: Vec<f64> = results[0].datapoints.iter().filter_map(|p| p.timestamp_ms).collect();
    assert!(emitted.windows(2).all(|w| w[0] <= w[1]));

    let input_ms = [1_000_000.0, 1_000_500.0, 1_001_000.0, 1_002_000.0, 1_003_000.0, 1_010_000.0, 1_010_200.0, 1_011_000.0];
    assert!(emitted.iter().all(|ts| input_ms.contains(ts)));
    // MAX picks the later, larger sample of the 1010 s window
    assert!(emitted.contains(&1_010_200.0));
}

#[test]
fn test_time_window_clips_frames() {
    let db = database();
    let (engine, _) = engine(two_sessions(), EngineConfig::default());
    let start = Utc.timestamp_opt(1001, 0).unwrap();
    let stop = Utc.timestamp_opt(1002, 0).unwrap();

    let results = engine
        .query(&[query("Speed", &db, SampleMethod::Nearest)], &start, &stop)
        .unwrap();
    assert_eq!(timestamps(&results[0]), vec![Some(1_001_000.0), Some(1_002_000.0)]);
}

#[test]
fn test_repeated_request_is_served_from_cache() {
    let db = database();
    let (engine, runs) = engine(two_sessions(), EngineConfig::default());
    let (start, stop) = window();
    let queries = [query("Speed", &db, SampleMethod::Nearest)];

    let first = engine.query(&queries, &start, &stop).unwrap();
    let runs_after_first = runs.load(Ordering::SeqCst);
    let second = engine.query(&queries, &start, &stop).unwrap();

    assert_eq!(first, second);
    assert_eq!(runs.load(Ordering::SeqCst), runs_after_first);
}

#[test]
fn test_unreadable_file_is_skipped() {
    let mut files = two_sessions();
    files[1].1 = b"1002.0;CAN;1;100;0;8;0102\n".to_vec();
    let db = database();
    let (engine, _) = engine(files, EngineConfig::default().with_cache_capacity(0));
    let (start, stop) = window();

    let results = engine
        .query(&[query("Speed", &db, SampleMethod::Nearest)], &start, &stop)
        .unwrap();
    assert_eq!(results[0].datapoints.len(), 5);
    assert_eq!(results[0].gap_count(), 1);
}

#[test]
fn test_list_files() {
    let (engine, _) = engine(two_sessions(), EngineConfig::default());
    let (start, stop) = window();

    let rows = engine.list_files(DEVICE, &start, &stop).unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].start_ms, Some(1_000_000.0));
    assert_eq!(rows[2].session, 2);
    assert_eq!(rows[3].size_mb, 0);
}

#[test]
fn test_budget_is_shared_across_devices() {
    let _ = env_logger::builder().is_test(true).try_init();
    let files = vec![
        device_file("AABBCCDD", 1, 1, 3 * MB / 4, export(&[(1000.0, 1, 0)])),
        device_file("11223344", 1, 1, MB / 2, export(&[(1000.0, 2, 0)])),
    ];
    let opened = Arc::new(Mutex::new(Vec::new()));
    let store = RecordingStore {
        inner: MemoryStore { files },
        opened: Arc::clone(&opened),
    };
    let engine = QueryEngine::new(
        Arc::new(store),
        Arc::new(CsvFrameDecoder::new()),
        Arc::new(DbcSignalDecoder::new()),
        EngineConfig::default(),
    );
    let db = database();
    let (start, stop) = window();

    let plan = plan(&[device_query("AABBCCDD", "Speed", &db), device_query("11223344", "Speed", &db)]);
    let results = engine.run(&plan, &start, &stop, 1).unwrap();

    // The second device's file would overflow what the first one left
    assert_eq!(results[0].datapoints.len(), 1);
    assert!(results[1].datapoints.is_empty());

    let opened = opened.lock().unwrap();
    let processed: u64 = opened.iter().map(|f| f.size).sum();
    assert_eq!(opened.len(), 1);
    assert!(processed <= MB);
}

#[test]
fn test_concurrent_query_is_busy() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let decoder = BlockingDecoder {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    };
    let engine = QueryEngine::new(
        Arc::new(MemoryStore {
            files: vec![log_file(1, 1, MB / 4, &[(1000.0, 10, 1000)])],
        }),
        Arc::new(CsvFrameDecoder::new()),
        Arc::new(decoder),
        EngineConfig::default(),
    );
    let db = database();
    let queries = [query("Speed", &db, SampleMethod::Nearest)];
    let (start, stop) = window();

    thread::scope(|scope| {
        let first = scope.spawn(|| engine.query(&queries, &start, &stop));
        entered_rx.recv().unwrap();

        // A different window misses the cache and needs the permit
        let later_stop = Utc.timestamp_opt(3000, 0).unwrap();
        let second = engine.query(&queries, &start, &later_stop);
        assert!(matches!(second, Err(QueryError::Busy)));

        drop(release_tx);
        let first = first.join().unwrap().unwrap();
        assert_eq!(first[0].datapoints.len(), 1);
    });

    // The permit is released with the first query
    let later_stop = Utc.timestamp_opt(3000, 0).unwrap();
    assert!(engine.query(&queries, &start, &later_stop).is_ok());
}

#[test]
fn test_non_ascii_file_is_skipped() {
    let mut files = two_sessions();
    files[1].1 = "1002.0;CAN;1;100;0;2;aéb\n".as_bytes().to_vec();
    let db = database();
    let (engine, _) = engine(files, EngineConfig::default());
    let (start, stop) = window();

    let results = engine
        .query(&[query("Speed", &db, SampleMethod::Nearest)], &start, &stop)
        .unwrap();
    assert_eq!(results[0].datapoints.len(), 5);
}

#[test]
fn test_raw_frames_are_merged_and_capped() {
    let mut files = two_sessions();
    files[0].1 = b"1000.0;CAN;1;100;0;1;01\n1000.1;LIN;1;21;0;1;02\n1000.2;CAN;2;7FF;0;2;0304\n".to_vec();
    let (engine, _) = engine(files, EngineConfig::default());
    let (start, stop) = window();

    let rows = engine.raw_frames(DEVICE, &start, &stop, 4).unwrap();
    let times: Vec<f64> = rows.iter().map(|r| r.time_ms).collect();
    assert_eq!(times, vec![1_000_000.0, 1_000_100.0, 1_000_200.0, 1_002_000.0]);
    assert_eq!(rows[1].interface, Interface::Lin);
    assert_eq!(rows[1].data, "02");
    assert_eq!(rows[2].channel, 2);
    assert_eq!(rows[2].data, "03 04");

    let json = serde_json::to_value(&rows[2]).unwrap();
    assert_eq!(json["ITF"], "CAN");
    assert_eq!(json["NOB"], 2);

    // Clipped to the window
    let start = Utc.timestamp_opt(1003, 0).unwrap();
    let stop = Utc.timestamp_opt(1010, 0).unwrap();
    let rows = engine.raw_frames(DEVICE, &start, &stop, 100).unwrap();
    let times: Vec<f64> = rows.iter().map(|r| r.time_ms).collect();
    assert_eq!(times, vec![1_003_000.0, 1_010_000.0]);
}

#[test]
fn test_annotations() {
    let (engine, _) = engine(two_sessions(), EngineConfig::default());
    let (start, stop) = window();

    let sessions = engine.annotations(DEVICE, AnnotationKind::Session, &start, &stop).unwrap();
    let times: Vec<f64> = sessions.iter().map(|a| a.time).collect();
    assert_eq!(times, vec![1_000_000.0, 1_010_000.0]);
    assert_eq!(
        sessions[0].text,
        "AABBCCDD/00000001/00000001.CSV\nSession: 1\nSplit: 1\nSize: 0 MB"
    );

    let splits = engine.annotations(DEVICE, AnnotationKind::Split, &start, &stop).unwrap();
    assert_eq!(splits.len(), 4);
    assert_eq!(splits[1].time, 1_002_000.0);
}

#[test]
fn test_list_files_reads_header() {
    let mut files = two_sessions();
    let mut content = b"# firmware version: 01.04.01\n# config crc32 checksum: 5E1A9A3C\n".to_vec();
    content.extend(export(&[(1000.0, 10, 1000)]));
    files[0].1 = content;
    let (engine, _) = engine(files, EngineConfig::default());
    let (start, stop) = window();

    let rows = engine.list_files(DEVICE, &start, &stop).unwrap();
    assert_eq!(rows[0].start_ms, Some(1_000_000.0));
    assert_eq!(rows[0].metadata.fw_version.as_deref(), Some("01.04.01"));
    assert_eq!(rows[0].metadata.config_crc.as_deref(), Some("5E1A9A3C"));
    assert!(rows[1].metadata.is_empty());

    let json = serde_json::to_value(&rows[0]).unwrap();
    assert_eq!(json["fw_version"], "01.04.01");
}

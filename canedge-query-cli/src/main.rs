//! CANedge Query CLI Application
//!
//! Command-line front end for the canedge-query library. It adds:
//! - Loading settings from config.toml and passwords.json
//! - Decoding databases discovered in the data root
//! - Time-series queries from a request file or inline targets
//! - Listing of devices, log files and database signals
//! - Raw frame tables and session / split annotations

use anyhow::{bail, Context, Result};
use canedge_query::request::parse_time;
use canedge_query::{
    parse_query_request, AnnotationKind, CsvFrameDecoder, DatabaseRegistry, DbcSignalDecoder, EngineConfig,
    FrameDecoder, FsLogStore, QueryEngine, TargetSpec,
};
use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;
mod output;

use config::AppConfig;

/// CANedge Query - Time-series queries over CANedge log archives
#[derive(Parser, Debug)]
#[command(name = "canedge-query")]
#[command(about = "Query decoded CAN/LIN signals from CANedge log archives", long_about = None)]
#[command(version)]
struct Args {
    /// Archive root holding device folders, *.dbc files and passwords.json
    #[arg(short, long, value_name = "DIR", env = "CANEDGE_DATA_ROOT", global = true)]
    data_root: Option<PathBuf>,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Data-volume budget per request in MB
    #[arg(long, value_name = "MB", global = true)]
    limit: Option<u64>,

    /// Transport protocol for multi-frame messages (none, uds, j1939, nmea)
    #[arg(long, value_name = "TYPE", global = true)]
    tp_type: Option<String>,

    /// Report value-table descriptions as text instead of numbers
    #[arg(long, global = true)]
    value_descriptions: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a time-series query
    Query {
        /// Request JSON file ("-" reads stdin)
        #[arg(short, long, value_name = "FILE", conflicts_with = "targets")]
        request: Option<PathBuf>,

        /// Target labels DEVICE:ITF:CHn:db:signal[:METHOD], e.g. AABBCCDD:CAN:CH1:obd:Speed:MAX
        #[arg(short, long = "target", value_name = "TARGET")]
        targets: Vec<String>,

        /// Start of the time range (RFC 3339)
        #[arg(long, value_name = "TIME", requires = "targets")]
        from: Option<String>,

        /// End of the time range (RFC 3339)
        #[arg(long, value_name = "TIME", requires = "targets")]
        to: Option<String>,

        /// Resampling interval in milliseconds
        #[arg(long, value_name = "MS", default_value_t = 1000)]
        interval: u64,

        /// Output file for the JSON results (default: stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Print a per-series summary table instead of JSON
        #[arg(long)]
        summary: bool,
    },

    /// List log files of a device within a time range
    Files {
        /// Device ID
        device: String,

        #[arg(long, value_name = "TIME")]
        from: String,

        #[arg(long, value_name = "TIME")]
        to: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the raw CAN and LIN frames of a device
    Raw {
        /// Device ID
        device: String,

        #[arg(long, value_name = "TIME")]
        from: String,

        #[arg(long, value_name = "TIME")]
        to: String,

        /// Maximum number of rows
        #[arg(long, value_name = "N", default_value_t = 1000)]
        max_rows: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List session or split start markers of a device
    Annotations {
        /// Device ID
        device: String,

        /// Marker kind (session, split)
        #[arg(long, value_name = "KIND", default_value = "session")]
        kind: String,

        #[arg(long, value_name = "TIME")]
        from: String,

        #[arg(long, value_name = "TIME")]
        to: String,
    },

    /// List device folders in the data root
    Devices,

    /// List decoding databases, or the signals of one database
    Signals {
        /// Database name (file stem of the DBC file)
        db: Option<String>,
    },
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let app_config = match &args.config {
        Some(path) => config::load_config(path)?,
        None => AppConfig::default(),
    };

    // Initialize logging
    init_logging(args.verbose, args.quiet, app_config.log_level.as_deref());

    log::info!("CANedge Query CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using query library v{}", canedge_query::VERSION);

    let data_root = args
        .data_root
        .clone()
        .or_else(|| app_config.data_root.clone())
        .context("No data root given (use --data-root, CANEDGE_DATA_ROOT or data_root in config.toml)")?;
    if !data_root.is_dir() {
        bail!("Data root {:?} is not a directory", data_root);
    }

    let engine_config = engine_config(&args, &app_config, &data_root)?;
    let frames: Arc<dyn FrameDecoder> = Arc::new(CsvFrameDecoder::new());
    let store = FsLogStore::new(&data_root)
        .with_start_times(Arc::clone(&frames))
        .with_passwords(engine_config.passwords.clone());
    let signals = Arc::new(DbcSignalDecoder::from_config(&engine_config));

    match args.command {
        Command::Devices => {
            for device in store.device_ids()? {
                println!("{}", device);
            }
        }
        Command::Signals { db } => {
            let registry = DatabaseRegistry::load_dir(&data_root)?;
            list_signals(&registry, db.as_deref())?;
        }
        Command::Files { device, from, to, json } => {
            let start = parse_time(&from)?;
            let stop = parse_time(&to)?;
            let engine = QueryEngine::new(Arc::new(store), frames, signals, engine_config);
            let rows = engine.list_files(&device, &start, &stop)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for line in output::file_table(&rows) {
                    println!("{}", line);
                }
            }
        }
        Command::Raw {
            device,
            from,
            to,
            max_rows,
            json,
        } => {
            let start = parse_time(&from)?;
            let stop = parse_time(&to)?;
            let engine = QueryEngine::new(Arc::new(store), frames, signals, engine_config);
            let rows = engine.raw_frames(&device, &start, &stop, max_rows)?;
            if rows.len() == max_rows {
                log::warn!("Output limited to {} rows (use --max-rows)", max_rows);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for line in output::raw_frame_table(&rows) {
                    println!("{}", line);
                }
            }
        }
        Command::Annotations { device, kind, from, to } => {
            let kind: AnnotationKind = kind.parse()?;
            let start = parse_time(&from)?;
            let stop = parse_time(&to)?;
            let engine = QueryEngine::new(Arc::new(store), frames, signals, engine_config);
            let annotations = engine.annotations(&device, kind, &start, &stop)?;
            println!("{}", serde_json::to_string_pretty(&annotations)?);
        }
        Command::Query {
            request,
            targets,
            from,
            to,
            interval,
            output: output_path,
            summary,
        } => {
            let body = match request {
                Some(path) => read_request(&path)?,
                None => inline_request(&targets, from.as_deref(), to.as_deref(), interval)?,
            };
            let registry = DatabaseRegistry::load_dir(&data_root)?;
            let parsed = parse_query_request(&body, &registry)?;
            for rejected in &parsed.rejected {
                log::warn!("Target {:?} ignored: {}", rejected.target, rejected.error);
            }

            let engine = QueryEngine::new(Arc::new(store), frames, signals, engine_config);
            let results = engine.query(&parsed.queries, &parsed.start, &parsed.stop)?;

            if summary {
                for line in output::series_summary(&results) {
                    println!("{}", line);
                }
            } else {
                let json = serde_json::to_string_pretty(&results)?;
                match output_path {
                    Some(path) => {
                        fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
                        log::info!("Wrote {} series to {:?}", results.len(), path);
                    }
                    None => println!("{}", json),
                }
            }
        }
    }

    Ok(())
}

/// Merge config file settings, command-line overrides and passwords
fn engine_config(args: &Args, app_config: &AppConfig, data_root: &Path) -> Result<EngineConfig> {
    let mut engine_config = app_config.engine.clone();
    if let Some(limit) = args.limit {
        engine_config.limit_mb = limit;
    }
    if let Some(tp_type) = &args.tp_type {
        engine_config.transport = tp_type.parse()?;
    }
    if args.value_descriptions {
        engine_config.value_descriptions = true;
    }
    for (device, password) in config::resolve_passwords(app_config, data_root)? {
        engine_config = engine_config.with_password(device, password);
    }

    log::debug!(
        "Limit {} MB, transport {}, {} passwords",
        engine_config.limit_mb,
        engine_config.transport,
        engine_config.passwords.len()
    );
    Ok(engine_config)
}

fn read_request(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut body = String::new();
        io::stdin().read_to_string(&mut body).context("Failed to read request from stdin")?;
        return Ok(body);
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read request file: {:?}", path))
}

/// Build a request body from inline target strings
fn inline_request(targets: &[String], from: Option<&str>, to: Option<&str>, interval_ms: u64) -> Result<String> {
    if targets.is_empty() {
        bail!("Give either --request FILE or at least one --target");
    }
    let (Some(from), Some(to)) = (from, to) else {
        bail!("--from and --to are required with --target");
    };

    let targets = targets
        .iter()
        .enumerate()
        .map(|(i, label)| {
            let spec: TargetSpec = label.parse().with_context(|| format!("Invalid target {:?}", label))?;
            Ok(serde_json::json!({ "refId": ref_id(i), "target": spec.to_document() }))
        })
        .collect::<Result<Vec<_>>>()?;
    let body = serde_json::json!({
        "range": { "from": from, "to": to },
        "intervalMs": interval_ms,
        "targets": targets,
    });
    Ok(body.to_string())
}

/// Spreadsheet-style reference IDs: A..Z, AA, AB, ...
fn ref_id(index: usize) -> String {
    let mut id = String::new();
    let mut n = index + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        id.insert(0, (b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    id
}

fn list_signals(registry: &DatabaseRegistry, db: Option<&str>) -> Result<()> {
    match db {
        Some(name) => {
            let signals = registry
                .signals(name)
                .with_context(|| format!("Unknown database {:?} (known: {})", name, registry.names().join(", ")))?;
            for signal in signals {
                println!("{}", signal);
            }
        }
        None => {
            if registry.is_empty() {
                log::warn!("No DBC files found in the data root");
            }
            for name in registry.names() {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

/// Initialize logging based on verbosity
fn init_logging(verbose: u8, quiet: bool, level_override: Option<&str>) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else if let Some(level) = level_override.and_then(|l| l.parse::<LevelFilter>().ok()) {
        level
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_ids() {
        assert_eq!(ref_id(0), "A");
        assert_eq!(ref_id(25), "Z");
        assert_eq!(ref_id(26), "AA");
        assert_eq!(ref_id(27), "AB");
    }

    #[test]
    fn test_inline_request_parses() {
        let body = inline_request(
            &["AABBCCDD:CAN:CH1:obd:Speed:MAX".to_string()],
            Some("2020-01-01T00:00:00Z"),
            Some("2020-01-01T01:00:00Z"),
            500,
        )
        .unwrap();

        let parsed = parse_query_request(&body, &DatabaseRegistry::new()).unwrap();
        assert_eq!(parsed.queries.len(), 1);
        assert_eq!(parsed.queries[0].ref_id, "A");
        assert_eq!(parsed.queries[0].interval_ms, 500);
        assert_eq!(parsed.queries[0].target, "AABBCCDD:CAN:CH1:obd:Speed:MAX");
        assert!(!parsed.queries[0].database.is_resolved());
        assert!(parsed.rejected.is_empty());
    }

    #[test]
    fn test_inline_request_rejects_bad_label() {
        let result = inline_request(
            &["AABBCCDD:CAN:CH1:obd:Speed:AVG".to_string()],
            Some("2020-01-01T00:00:00Z"),
            Some("2020-01-01T01:00:00Z"),
            500,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_inline_request_needs_range() {
        assert!(inline_request(&["X:CAN:CH1:db:S".to_string()], None, None, 1000).is_err());
        assert!(inline_request(&[], Some("a"), Some("b"), 1000).is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "canedge-query",
            "--data-root",
            "/srv/LOG",
            "query",
            "-t",
            "AABBCCDD:CAN:CH1:obd:Speed",
            "--from",
            "2020-01-01T00:00:00Z",
            "--to",
            "2020-01-02T00:00:00Z",
            "--limit",
            "20",
        ])
        .unwrap();
        assert_eq!(args.data_root, Some(PathBuf::from("/srv/LOG")));
        assert_eq!(args.limit, Some(20));
        match args.command {
            Command::Query { targets, interval, .. } => {
                assert_eq!(targets.len(), 1);
                assert_eq!(interval, 1000);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_raw_and_annotation_args() {
        let args = Args::try_parse_from([
            "canedge-query",
            "raw",
            "AABBCCDD",
            "--from",
            "2020-01-01T00:00:00Z",
            "--to",
            "2020-01-02T00:00:00Z",
            "--value-descriptions",
        ])
        .unwrap();
        assert!(args.value_descriptions);
        match args.command {
            Command::Raw { device, max_rows, json, .. } => {
                assert_eq!(device, "AABBCCDD");
                assert_eq!(max_rows, 1000);
                assert!(!json);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = Args::try_parse_from([
            "canedge-query",
            "annotations",
            "AABBCCDD",
            "--kind",
            "split",
            "--from",
            "2020-01-01T00:00:00Z",
            "--to",
            "2020-01-02T00:00:00Z",
        ])
        .unwrap();
        match args.command {
            Command::Annotations { kind, .. } => {
                assert_eq!(kind.parse::<AnnotationKind>().unwrap(), AnnotationKind::Split);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_value_descriptions_flag_reaches_engine_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::try_parse_from(["canedge-query", "--value-descriptions", "devices"]).unwrap();
        let config = engine_config(&args, &AppConfig::default(), dir.path()).unwrap();
        assert!(config.value_descriptions);

        let args = Args::try_parse_from(["canedge-query", "devices"]).unwrap();
        let config = engine_config(&args, &AppConfig::default(), dir.path()).unwrap();
        assert!(!config.value_descriptions);
    }
}

//! Query request decoding
//!
//! Requests arrive in the shape used by the Grafana JSON datasource:
//!
//! ```json
//! {
//!   "range": {"from": "2020-10-28T14:33:57.732Z", "to": "2020-10-28T15:01:25.048Z"},
//!   "intervalMs": 2000,
//!   "targets": [
//!     {"refId": "A", "target": "{\"device\":\"AABBCCDD\",\"itf\":\"CAN\",\"chn\":\"CH1\",\"db\":\"obd\",\"signal\":\"(Speed|Rpm)\"}"}
//!   ]
//! }
//! ```
//!
//! Each `target` is itself a JSON document. Multi-select signals `(A|B)`
//! expand to one [`SignalQuery`] per signal. A [`TargetSpec`] also parses
//! from its label form, `AABBCCDD:CAN:CH1:obd:Speed:MAX`.

use crate::signals::{load_dbc_file, SignalDatabase};
use crate::types::{DatabaseRef, Interface, QueryError, Result, SampleMethod, SignalQuery, Timestamp};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Loaded decoding databases by lower-case name
#[derive(Clone, Default)]
pub struct DatabaseRegistry {
    databases: BTreeMap<String, Arc<SignalDatabase>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.dbc` file of a directory, named by file stem
    ///
    /// Files that fail to parse are logged and left out.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::new();
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| ext.eq_ignore_ascii_case("dbc"))
            })
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match load_dbc_file(&path) {
                Ok(database) => registry.insert(name, database),
                Err(e) => log::warn!("Skipping {:?}: {}", path, e),
            }
        }

        log::info!("Loaded {} databases from {:?}", registry.len(), dir);
        Ok(registry)
    }

    pub fn insert(&mut self, name: &str, database: SignalDatabase) {
        self.databases.insert(name.to_lowercase(), Arc::new(database));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<SignalDatabase>> {
        self.databases.get(&name.to_lowercase())
    }

    /// Reference by name, unresolved if no such database is loaded
    pub fn resolve(&self, name: &str) -> DatabaseRef {
        let name = name.to_lowercase();
        match self.databases.get(&name) {
            Some(database) => DatabaseRef::new(name, Arc::clone(database)),
            None => DatabaseRef::unresolved(name),
        }
    }

    /// Database names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.databases.keys().map(String::as_str).collect()
    }

    /// Signal names of a database, sorted
    pub fn signals(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(|db| db.signal_names())
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}

/// Query request body
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub range: TimeRange,
    #[serde(rename = "intervalMs")]
    pub interval_ms: u64,
    pub targets: Vec<TargetRequest>,
    #[serde(rename = "maxDataPoints", default)]
    pub max_data_points: Option<u64>,
}

/// Query time range as ISO-8601 UTC strings
#[derive(Debug, Clone, Deserialize)]
pub struct TimeRange {
    pub from: String,
    pub to: String,
}

/// One panel query
#[derive(Debug, Clone, Deserialize)]
pub struct TargetRequest {
    #[serde(rename = "refId", default)]
    pub ref_id: String,
    /// JSON-encoded target document
    pub target: String,
}

/// Decoded target document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub device: String,
    pub interface: Interface,
    pub channel: u8,
    /// Lower-case database name
    pub db: String,
    /// One or more signal names
    pub signals: Vec<String>,
    /// Explicitly requested method
    pub method: Option<SampleMethod>,
}

impl TargetSpec {
    /// Label of the series for one of the target's signals
    pub fn label(&self, signal: &str) -> String {
        let mut parts = vec![
            self.device.clone(),
            self.interface.to_string(),
            format!("CH{}", self.channel),
            self.db.clone(),
            signal.to_string(),
        ];
        if let Some(method) = self.method {
            parts.push(method.to_string());
        }
        parts.join(":")
    }

    /// JSON target document equivalent to this target
    pub fn to_document(&self) -> String {
        let signal = match self.signals.as_slice() {
            [single] => single.clone(),
            many => format!("({})", many.join("|")),
        };
        let mut document = serde_json::json!({
            "device": self.device,
            "itf": self.interface.to_string(),
            "chn": format!("CH{}", self.channel),
            "db": self.db,
            "signal": signal,
        });
        if let Some(method) = self.method {
            document["method"] = serde_json::Value::String(method.to_string());
        }
        document.to_string()
    }
}

/// Parse the label form `DEVICE:ITF:CHn:db:signal[:METHOD]`
///
/// `signal` may be a `(A|B)` multi-selection.
impl FromStr for TargetSpec {
    type Err = QueryError;

    fn from_str(label: &str) -> Result<Self> {
        let parts: Vec<&str> = label.trim().split(':').collect();
        if !(5..=6).contains(&parts.len()) {
            return Err(QueryError::MalformedTarget(format!(
                "{:?}: expected DEVICE:ITF:CHn:db:signal[:METHOD]",
                label
            )));
        }
        if parts[0].is_empty() {
            return Err(QueryError::MissingField("device"));
        }
        let signals = split_signals(parts[4]);
        if signals.is_empty() {
            return Err(QueryError::MissingField("signal"));
        }

        Ok(TargetSpec {
            device: parts[0].to_string(),
            interface: parts[1].parse()?,
            channel: parse_channel(&serde_json::Value::String(parts[2].to_string()))?,
            db: parts[3].to_lowercase(),
            signals,
            method: parts.get(5).map(|m| m.parse::<SampleMethod>()).transpose()?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    device: Option<String>,
    itf: Option<String>,
    chn: Option<serde_json::Value>,
    db: Option<String>,
    signal: Option<String>,
    method: Option<String>,
}

/// Target left out of a request
#[derive(Debug)]
pub struct RejectedTarget {
    pub ref_id: String,
    pub target: String,
    pub error: QueryError,
}

/// A decoded request, ready for the engine
#[derive(Debug)]
pub struct ParsedRequest {
    pub start: Timestamp,
    pub stop: Timestamp,
    pub queries: Vec<SignalQuery>,
    pub rejected: Vec<RejectedTarget>,
}

/// Decode a query request body
///
/// Fails if the body or its time range is unusable. Malformed targets are
/// collected in [`ParsedRequest::rejected`]; targets naming an unknown
/// database are kept with an unresolved database so they yield an empty series.
pub fn parse_query_request(body: &str, registry: &DatabaseRegistry) -> Result<ParsedRequest> {
    let request: QueryRequest = serde_json::from_str(body)?;
    let start = parse_time(&request.range.from)?;
    let stop = parse_time(&request.range.to)?;
    if stop < start {
        return Err(QueryError::InvalidField {
            field: "range",
            reason: format!("{} is before {}", request.range.to, request.range.from),
        });
    }

    let mut queries = Vec::new();
    let mut rejected = Vec::new();
    for target in &request.targets {
        let spec = match parse_target(&target.target) {
            Ok(spec) => spec,
            Err(error) => {
                log::warn!("Failed to query target {}: {}", target.target, error);
                rejected.push(RejectedTarget {
                    ref_id: target.ref_id.clone(),
                    target: target.target.clone(),
                    error,
                });
                continue;
            }
        };

        let database = registry.resolve(&spec.db);
        if !database.is_resolved() {
            log::warn!("Unknown DB: {}", spec.db);
        }
        for signal in &spec.signals {
            queries.push(SignalQuery {
                ref_id: target.ref_id.clone(),
                target: spec.label(signal),
                device: spec.device.clone(),
                interface: spec.interface,
                channel: spec.channel,
                database: database.clone(),
                signal: signal.clone(),
                interval_ms: request.interval_ms,
                method: spec.method.unwrap_or_default(),
            });
        }
    }

    Ok(ParsedRequest {
        start,
        stop,
        queries,
        rejected,
    })
}

/// Decode one target document
pub fn parse_target(target: &str) -> Result<TargetSpec> {
    let raw: RawTarget =
        serde_json::from_str(target).map_err(|e| QueryError::MalformedTarget(e.to_string()))?;

    let device = raw.device.ok_or(QueryError::MissingField("device"))?;
    let interface: Interface = raw.itf.ok_or(QueryError::MissingField("itf"))?.parse()?;
    let channel = parse_channel(raw.chn.as_ref().ok_or(QueryError::MissingField("chn"))?)?;
    let db = raw.db.ok_or(QueryError::MissingField("db"))?.to_lowercase();
    let signals = split_signals(&raw.signal.ok_or(QueryError::MissingField("signal"))?);
    if signals.is_empty() {
        return Err(QueryError::MissingField("signal"));
    }
    let method = raw.method.map(|m| m.parse::<SampleMethod>()).transpose()?;

    Ok(TargetSpec {
        device,
        interface,
        channel,
        db,
        signals,
        method,
    })
}

/// Parse an ISO-8601 timestamp; a missing offset means UTC
pub fn parse_time(value: &str) -> Result<Timestamp> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| QueryError::InvalidField {
            field: "range",
            reason: format!("{:?}: {}", value, e),
        })
}

/// `"CH1"`, `"ch2"`, `"1"` or `1`
fn parse_channel(value: &serde_json::Value) -> Result<u8> {
    let unknown = || QueryError::UnknownVariant {
        field: "chn",
        value: value.to_string().trim_matches('"').to_string(),
    };
    let number = match value {
        serde_json::Value::Number(n) => n.as_u64().ok_or_else(unknown)?,
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            let digits = match (trimmed.get(..2), trimmed.get(2..)) {
                (Some(prefix), Some(rest)) if prefix.eq_ignore_ascii_case("ch") => rest,
                _ => trimmed,
            };
            digits.parse::<u64>().map_err(|_| unknown())?
        }
        _ => return Err(unknown()),
    };
    u8::try_from(number)
        .ok()
        .filter(|chn| *chn > 0)
        .ok_or_else(unknown)
}

/// Split a `(A|B|C)` multi-selection into names
fn split_signals(value: &str) -> Vec<String> {
    value
        .replace(['(', ')'], "")
        .split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

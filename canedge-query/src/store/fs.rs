//! File system archive store
//!
//! Serves archives laid out the way CANedge devices write them:
//!
//! ```text
//! <root>/<DEVICE>/<SESSION>/<SPLIT>[-<CRC>].<EXT>
//! AABBCCDD/00000001/00000001.MF4
//! AABBCCDD/00000002/00000003-5F8C1A2B.MFC
//! ```
//!
//! Device IDs are 8 hex digits, session and split numbers 8 decimal digits.

use crate::formats::FrameDecoder;
use crate::store::LogStore;
use crate::types::{timestamp_to_ns, LogFileRef, QueryError, Result, Timestamp};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Log file extensions recognized in an archive
pub const LOG_EXTENSIONS: [&str; 5] = ["MF4", "MFC", "MFM", "MFE", "CSV"];

/// Components parsed from an archive-relative path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPathParts {
    pub device: String,
    pub session: Option<u32>,
    pub split: Option<u32>,
    /// Upper-case extension without the dot
    pub extension: Option<String>,
}

/// Match as much of `path` as possible to device / session / split / extension
///
/// Returns `None` if the path does not follow the archive layout.
pub fn parse_log_path(path: &str) -> Option<LogPathParts> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if segments.is_empty() || segments.len() > 3 {
        return None;
    }

    let device = segments[0];
    if device.len() != 8 || !device.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let session = match segments.get(1) {
        Some(s) => Some(parse_number(s)?),
        None => None,
    };

    let (split, extension) = match segments.get(2) {
        Some(file_name) => {
            let (stem, extension) = file_name.rsplit_once('.')?;
            let extension = extension.to_ascii_uppercase();
            if !LOG_EXTENSIONS.contains(&extension.as_str()) {
                return None;
            }
            let split = match stem.split_once('-') {
                Some((split, crc)) => {
                    if crc.len() != 8 || !crc.chars().all(|c| c.is_ascii_hexdigit()) {
                        return None;
                    }
                    split
                }
                None => stem,
            };
            (Some(parse_number(split)?), Some(extension))
        }
        None => (None, None),
    };

    Some(LogPathParts {
        device: device.to_string(),
        session,
        split,
        extension,
    })
}

fn parse_number(s: &str) -> Option<u32> {
    if s.len() != 8 || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Keep the files that may hold data within `[start_ns, stop_ns]`
///
/// A file covers the time from its first measurement to the first measurement
/// of the next file. Files with an unknown start are kept.
pub fn select_in_window(
    files: Vec<LogFileRef>,
    starts: &[Option<u64>],
    start_ns: u64,
    stop_ns: u64,
) -> Vec<LogFileRef> {
    files
        .into_iter()
        .enumerate()
        .filter(|(i, _)| {
            let Some(file_start) = starts.get(*i).copied().flatten() else {
                return true;
            };
            let next_start = starts.iter().skip(i + 1).find_map(|s| *s);
            file_start <= stop_ns && next_start.map_or(true, |next| next >= start_ns)
        })
        .map(|(_, file)| file)
        .collect()
}

/// Archive store on the local file system
pub struct FsLogStore {
    root: PathBuf,
    start_reader: Option<Arc<dyn FrameDecoder>>,
    passwords: BTreeMap<String, String>,
}

impl FsLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            start_reader: None,
            passwords: BTreeMap::new(),
        }
    }

    /// Builder method: select files by time using each file's first measurement
    ///
    /// Without one every file of the device is listed.
    pub fn with_start_times(mut self, decoder: Arc<dyn FrameDecoder>) -> Self {
        self.start_reader = Some(decoder);
        self
    }

    /// Builder method: log file passwords by device ID, used when reading start times
    pub fn with_passwords(mut self, passwords: BTreeMap<String, String>) -> Self {
        self.passwords = passwords;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Device IDs present in the archive, sorted
    pub fn device_ids(&self) -> Result<Vec<String>> {
        let mut devices: Vec<String> = self
            .sorted_entries(&self.root, true)?
            .into_iter()
            .filter(|name| parse_log_path(name).is_some())
            .collect();
        devices.dedup();
        Ok(devices)
    }

    /// Every log file of a device, ordered by (session, split)
    pub fn device_log_files(&self, device: &str) -> Result<Vec<LogFileRef>> {
        let device_dir = self.root.join(device);
        let mut files = Vec::new();

        for session_name in self.sorted_entries(&device_dir, true)? {
            let session_dir = device_dir.join(&session_name);
            for file_name in self.sorted_entries(&session_dir, false)? {
                let path = format!("{}/{}/{}", device, session_name, file_name);
                let Some(parts) = parse_log_path(&path) else {
                    log::trace!("Ignoring {} (not a log file)", path);
                    continue;
                };
                let (Some(session), Some(split)) = (parts.session, parts.split) else {
                    continue;
                };
                let size = fs::metadata(session_dir.join(&file_name))
                    .map_err(|e| QueryError::Store(format!("{}: {}", path, e)))?
                    .len();
                files.push(LogFileRef {
                    device: parts.device,
                    session,
                    split,
                    size,
                    path,
                });
            }
        }

        files.sort_by_key(|f| (f.session, f.split));
        Ok(files)
    }

    /// Names of the directory entries of `dir`, sorted; a missing directory is empty
    fn sorted_entries(&self, dir: &Path, directories: bool) -> Result<Vec<String>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QueryError::Store(format!("{:?}: {}", dir, e))),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| QueryError::Store(format!("{:?}: {}", dir, e)))?;
            let file_type = entry
                .file_type()
                .map_err(|e| QueryError::Store(format!("{:?}: {}", entry.path(), e)))?;
            if file_type.is_dir() != directories {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_start(&self, decoder: &dyn FrameDecoder, file: &LogFileRef) -> Option<u64> {
        let password = self.passwords.get(&file.device).map(String::as_str);
        let result = self
            .open(file)
            .and_then(|mut reader| decoder.first_timestamp(&mut reader, password));
        match result {
            Ok(start) => start,
            Err(e) => {
                log::warn!("File: {} - unable to read start time: {}", file.path, e);
                None
            }
        }
    }
}

impl LogStore for FsLogStore {
    fn list_log_files(&self, device: &str, start: &Timestamp, stop: &Timestamp) -> Result<Vec<LogFileRef>> {
        let files = self.device_log_files(device)?;
        let Some(decoder) = self.start_reader.as_deref() else {
            return Ok(files);
        };

        let starts: Vec<Option<u64>> = files.iter().map(|f| self.read_start(decoder, f)).collect();
        let selected = select_in_window(files, &starts, timestamp_to_ns(start), timestamp_to_ns(stop));
        log::debug!("{} log files of {} in time range", selected.len(), device);
        Ok(selected)
    }

    fn open(&self, file: &LogFileRef) -> Result<Box<dyn Read + Send>> {
        let handle = fs::File::open(self.root.join(&file.path))
            .map_err(|e| QueryError::Store(format!("{}: {}", file.path, e)))?;
        Ok(Box::new(BufReader::new(handle)))
    }

    fn size(&self, file: &LogFileRef) -> Result<u64> {
        fs::metadata(self.root.join(&file.path))
            .map(|m| m.len())
            .map_err(|e| QueryError::Store(format!("{}: {}", file.path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{CsvFrameDecoder, ParsedLogFile};
    use crate::types::Interface;
    use chrono::TimeZone;
    use chrono::Utc;

    fn file(session: u32, split: u32) -> LogFileRef {
        LogFileRef {
            device: "AABBCCDD".to_string(),
            session,
            split,
            size: 0,
            path: format!("AABBCCDD/{:08}/{:08}.MF4", session, split),
        }
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_log_path() {
        let parts = parse_log_path("AABBCCDD/00000002/00000003-5F8C1A2B.mfc").unwrap();
        assert_eq!(parts.device, "AABBCCDD");
        assert_eq!(parts.session, Some(2));
        assert_eq!(parts.split, Some(3));
        assert_eq!(parts.extension.as_deref(), Some("MFC"));

        let device_only = parse_log_path("/3BA199E2").unwrap();
        assert_eq!(device_only.session, None);

        assert!(parse_log_path("AABBCCDD/00000001/00000001.txt").is_none());
        assert!(parse_log_path("LOG/00000001").is_none());
        assert!(parse_log_path("AABBCCDD/1/00000001.MF4").is_none());
    }

    #[test]
    fn test_select_in_window() {
        let files = vec![file(1, 1), file(1, 2), file(1, 3), file(2, 1)];
        let starts = vec![Some(0), Some(100), Some(200), Some(300)];

        // The file covering the window start is included
        let selected = select_in_window(files.clone(), &starts, 150, 250);
        let splits: Vec<_> = selected.iter().map(|f| (f.session, f.split)).collect();
        assert_eq!(splits, vec![(1, 2), (1, 3)]);

        // After the last file start, only the last file remains
        let selected = select_in_window(files.clone(), &starts, 400, 500);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].session, 2);

        // Unknown starts are kept
        let selected = select_in_window(files, &[None, Some(100), None, Some(300)], 500, 600);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_device_log_files_ordering() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "AABBCCDD/00000002/00000001.MF4", "x");
        write(dir.path(), "AABBCCDD/00000001/00000002.MF4", "xy");
        write(dir.path(), "AABBCCDD/00000001/00000001.MF4", "xyz");
        write(dir.path(), "AABBCCDD/00000001/notes.txt", "ignored");
        write(dir.path(), "11223344/00000001/00000001.MF4", "");
        fs::create_dir_all(dir.path().join("not-a-device")).unwrap();

        let store = FsLogStore::new(dir.path());
        assert_eq!(store.device_ids().unwrap(), vec!["11223344", "AABBCCDD"]);

        let files = store.device_log_files("AABBCCDD").unwrap();
        let order: Vec<_> = files.iter().map(|f| (f.session, f.split, f.size)).collect();
        assert_eq!(order, vec![(1, 1, 3), (1, 2, 2), (2, 1, 1)]);

        assert!(store.device_log_files("DEADBEEF").unwrap().is_empty());
    }

    #[test]
    fn test_list_with_start_times() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "AABBCCDD/00000001/00000001.CSV", "100.0;CAN;1;100;0;1;00\n");
        write(dir.path(), "AABBCCDD/00000001/00000002.CSV", "200.0;CAN;1;100;0;1;00\n");
        write(dir.path(), "AABBCCDD/00000001/00000003.CSV", "300.0;CAN;1;100;0;1;00\n");

        let store = FsLogStore::new(dir.path()).with_start_times(Arc::new(CsvFrameDecoder::new()));
        let start = Utc.timestamp_opt(250, 0).unwrap();
        let stop = Utc.timestamp_opt(400, 0).unwrap();
        let files = store.list_log_files("AABBCCDD", &start, &stop).unwrap();
        let splits: Vec<_> = files.iter().map(|f| f.split).collect();
        assert_eq!(splits, vec![2, 3]);

        let mut reader = store.open(&files[0]).unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert!(content.starts_with("200.0"));
        assert_eq!(store.size(&files[0]).unwrap(), content.len() as u64);
    }

    /// Text export that only reveals its start time with the right password
    struct LockedDecoder;

    impl FrameDecoder for LockedDecoder {
        fn parse(&self, _: &mut dyn Read, _: &[Interface], _: Option<&str>) -> Result<ParsedLogFile> {
            Err(QueryError::LogParse("not supported".to_string()))
        }

        fn first_timestamp(&self, reader: &mut dyn Read, password: Option<&str>) -> Result<Option<u64>> {
            match password {
                Some("secret") => CsvFrameDecoder::new().first_timestamp(reader, None),
                _ => Err(QueryError::LogParse("encrypted".to_string())),
            }
        }
    }

    #[test]
    fn test_start_time_uses_device_password() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "AABBCCDD/00000001/00000001.CSV", "100.0;CAN;1;100;0;1;00\n");
        write(dir.path(), "AABBCCDD/00000001/00000002.CSV", "200.0;CAN;1;100;0;1;00\n");
        let start = Utc.timestamp_opt(250, 0).unwrap();
        let stop = Utc.timestamp_opt(400, 0).unwrap();

        // Without the password no start is known and both files are kept
        let locked = FsLogStore::new(dir.path()).with_start_times(Arc::new(LockedDecoder));
        assert_eq!(locked.list_log_files("AABBCCDD", &start, &stop).unwrap().len(), 2);

        let passwords = BTreeMap::from([("AABBCCDD".to_string(), "secret".to_string())]);
        let unlocked = FsLogStore::new(dir.path())
            .with_start_times(Arc::new(LockedDecoder))
            .with_passwords(passwords);
        let files = unlocked.list_log_files("AABBCCDD", &start, &stop).unwrap();
        let splits: Vec<_> = files.iter().map(|f| f.split).collect();
        assert_eq!(splits, vec![2]);
    }
}

//! Text export frame decoder
//!
//! Reads semicolon separated frame exports, one frame per line:
//!
//! ```text
//! TimestampEpoch;Interface;BusChannel;ID;IDE;DataLength;DataBytes
//! 1603895728.164100;CAN;1;7E8;0;8;04410D3200000000
//! ```
//!
//! Timestamps are epoch seconds with up to nanosecond decimals, identifiers and
//! payloads are hexadecimal. A header line and blank lines are skipped.
//!
//! Lines starting with `#` are comments. A leading comment block may carry
//! the device's file header as `# key: value` lines:
//!
//! ```text
//! # hardware version: 00.02
//! # firmware version: 01.04.01
//! # config crc32 checksum: 5E1A9A3C
//! # storage free: 7340032
//! # storage total: 15728640
//! # comment: test drive
//! ```

use crate::formats::{FrameDecoder, ParsedLogFile};
use crate::types::{Interface, LogFileMetadata, QueryError, RawFrame, RawFrameTable, Result};
use std::io::{BufRead, BufReader, Read};

const COLUMNS: usize = 7;

/// Frame decoder for semicolon separated text exports
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvFrameDecoder;

impl CsvFrameDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl FrameDecoder for CsvFrameDecoder {
    fn parse(
        &self,
        reader: &mut dyn Read,
        interfaces: &[Interface],
        password: Option<&str>,
    ) -> Result<ParsedLogFile> {
        if password.is_some() {
            log::debug!("Text exports are not encrypted, ignoring password");
        }

        let mut can = Vec::new();
        let mut lin = Vec::new();
        let mut start_ns: Option<u64> = None;
        let mut metadata = LogFileMetadata::default();

        for (index, line) in BufReader::new(reader).lines().enumerate() {
            let line = line?;
            if start_ns.is_none() {
                if let Some(comment) = comment_text(&line) {
                    apply_header_line(&mut metadata, comment);
                    continue;
                }
            }
            let Some((interface, frame)) = parse_line(&line, index + 1)? else {
                continue;
            };

            // The first row is the first measurement, sorted or not
            start_ns.get_or_insert(frame.timestamp_ns);
            if !interfaces.contains(&interface) {
                continue;
            }
            match interface {
                Interface::Can => can.push(frame),
                Interface::Lin => lin.push(frame),
            }
        }

        log::debug!("Parsed {} CAN and {} LIN frames", can.len(), lin.len());

        Ok(ParsedLogFile {
            start_ns,
            can: RawFrameTable::from_frames(can),
            lin: RawFrameTable::from_frames(lin),
            metadata,
        })
    }

    fn first_timestamp(&self, reader: &mut dyn Read, _password: Option<&str>) -> Result<Option<u64>> {
        for (index, line) in BufReader::new(reader).lines().enumerate() {
            if let Some((_, frame)) = parse_line(&line?, index + 1)? {
                return Ok(Some(frame.timestamp_ns));
            }
        }
        Ok(None)
    }

    fn metadata(&self, reader: &mut dyn Read, _password: Option<&str>) -> Result<LogFileMetadata> {
        let mut metadata = LogFileMetadata::default();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            match comment_text(&line) {
                Some(comment) => apply_header_line(&mut metadata, comment),
                None if line.trim().is_empty() || is_column_header(&line) => {}
                None => break,
            }
        }
        Ok(metadata)
    }
}

fn comment_text(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix('#')
}

fn is_column_header(line: &str) -> bool {
    line.trim_start().starts_with(|c: char| c.is_ascii_alphabetic())
}

/// Fill one header field from `key: value`; unknown keys are ignored
fn apply_header_line(metadata: &mut LogFileMetadata, comment: &str) {
    let Some((key, value)) = comment.split_once(':') else {
        return;
    };
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    let kb = |field: &str| match value.parse::<u64>() {
        Ok(kb) => Some(kb),
        Err(_) => {
            log::warn!("Ignoring {} value {:?}", field, value);
            None
        }
    };

    match key.trim().to_ascii_lowercase().as_str() {
        "config crc32 checksum" | "config crc" => metadata.config_crc = Some(value.to_string()),
        "hardware version" => metadata.hw_version = Some(value.to_string()),
        "firmware version" => metadata.fw_version = Some(value.to_string()),
        "storage free" => metadata.storage_free_kb = kb("storage free"),
        "storage total" => metadata.storage_total_kb = kb("storage total"),
        "comment" => metadata.comment = Some(value.to_string()),
        _ => {}
    }
}

/// Parse one line; `Ok(None)` for blank, comment and header lines
fn parse_line(line: &str, line_no: usize) -> Result<Option<(Interface, RawFrame)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || is_column_header(line) {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split(';').map(str::trim).collect();
    if fields.len() != COLUMNS {
        return Err(parse_error(
            line_no,
            format!("expected {} columns, found {}", COLUMNS, fields.len()),
        ));
    }

    let timestamp_ns = parse_epoch_seconds(fields[0]).map_err(|e| parse_error(line_no, e))?;
    let interface: Interface = fields[1]
        .parse()
        .map_err(|_| parse_error(line_no, format!("unknown interface {:?}", fields[1])))?;
    let channel: u8 = fields[2]
        .parse()
        .map_err(|_| parse_error(line_no, format!("invalid channel {:?}", fields[2])))?;
    let id = u32::from_str_radix(strip_hex_prefix(fields[3]), 16)
        .map_err(|_| parse_error(line_no, format!("invalid ID {:?}", fields[3])))?;
    let is_extended = match fields[4] {
        "0" | "" => false,
        "1" => true,
        other => return Err(parse_error(line_no, format!("invalid IDE {:?}", other))),
    };
    let data_length: usize = fields[5]
        .parse()
        .map_err(|_| parse_error(line_no, format!("invalid data length {:?}", fields[5])))?;
    let data = parse_hex_bytes(fields[6]).map_err(|e| parse_error(line_no, e))?;
    if data.len() != data_length {
        return Err(parse_error(
            line_no,
            format!("data length {} does not match {} payload bytes", data_length, data.len()),
        ));
    }

    Ok(Some((
        interface,
        RawFrame {
            timestamp_ns,
            channel,
            id,
            // LIN has no extended identifiers
            is_extended: is_extended && interface == Interface::Can,
            data,
        },
    )))
}

fn parse_error(line_no: usize, reason: String) -> QueryError {
    QueryError::LogParse(format!("line {}: {}", line_no, reason))
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

/// Parse `seconds[.fraction]` into nanoseconds without float rounding
fn parse_epoch_seconds(s: &str) -> std::result::Result<u64, String> {
    let (secs, fraction) = s.split_once('.').unwrap_or((s, ""));
    let secs: u64 = secs
        .parse()
        .map_err(|_| format!("invalid timestamp {:?}", s))?;
    if fraction.len() > 9 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid timestamp fraction {:?}", s));
    }
    let nanos: u64 = if fraction.is_empty() {
        0
    } else {
        format!("{:0<9}", fraction)
            .parse()
            .map_err(|_| format!("invalid timestamp {:?}", s))?
    };
    secs.checked_mul(1_000_000_000)
        .and_then(|ns| ns.checked_add(nanos))
        .ok_or_else(|| format!("timestamp out of range {:?}", s))
}

/// Parse hex payload bytes, with or without separating spaces
fn parse_hex_bytes(s: &str) -> std::result::Result<Vec<u8>, String> {
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(format!("invalid hex payload {:?}", s));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in {:?}", s));
    }
    Ok(digits
        .chunks_exact(2)
        .map(|pair| (hex_value(pair[0]) << 4) | hex_value(pair[1]))
        .collect())
}

/// Value of one ASCII hex digit
fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

//! Human-readable console output

use canedge_query::{LogFileInfo, RawFrameRow, TimeSeriesResult};
use chrono::DateTime;

/// Format epoch milliseconds as an ISO-8601 UTC timestamp
pub fn format_epoch_ms(epoch_ms: f64) -> String {
    DateTime::from_timestamp_millis(epoch_ms as i64)
        .map(|ts| ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| format!("{}", epoch_ms))
}

/// One line per series: target, point count, gaps, first and last timestamp
pub fn series_summary(results: &[TimeSeriesResult]) -> Vec<String> {
    let mut lines = vec![format!(
        "{:<48} {:>8} {:>5}  {:<24} {:<24}",
        "TARGET", "POINTS", "GAPS", "FIRST", "LAST"
    )];
    for series in results {
        let mut timestamps = series.datapoints.iter().filter_map(|p| p.timestamp_ms);
        let first = timestamps.next();
        let last = timestamps.last().or(first);
        lines.push(format!(
            "{:<48} {:>8} {:>5}  {:<24} {:<24}",
            series.target,
            series.datapoints.len() - series.gap_count(),
            series.gap_count(),
            first.map(format_epoch_ms).unwrap_or_else(|| "-".to_string()),
            last.map(format_epoch_ms).unwrap_or_else(|| "-".to_string()),
        ));
    }
    lines
}

/// Table of log files with their header information
pub fn file_table(rows: &[LogFileInfo]) -> Vec<String> {
    let dash = || "-".to_string();
    let mut lines = vec![format!(
        "{:<24} {:<8} {:>8} {:>8} {:>9}  {:<10} {:<8} {:<10} {:>15}  {:<36} {}",
        "TIME", "DEVICE", "SESSION", "SPLIT", "SIZE [MB]", "CONFIG CRC", "HW", "FW", "STORAGE [MB]", "NAME", "META"
    )];
    for row in rows {
        let meta = &row.metadata;
        lines.push(format!(
            "{:<24} {:<8} {:>8} {:>8} {:>9}  {:<10} {:<8} {:<10} {:>15}  {:<36} {}",
            row.start_ms.map(format_epoch_ms).unwrap_or_else(dash),
            row.device,
            row.session,
            row.split,
            row.size_mb,
            meta.config_crc.clone().unwrap_or_else(dash),
            meta.hw_version.clone().unwrap_or_else(dash),
            meta.fw_version.clone().unwrap_or_else(dash),
            meta.storage_mb()
                .map(|(used, total)| format!("{}/{}", used, total))
                .unwrap_or_else(dash),
            row.path,
            meta.comment.clone().unwrap_or_default(),
        ));
    }
    lines
}

/// Table of raw frames, identifiers in hex
pub fn raw_frame_table(rows: &[RawFrameRow]) -> Vec<String> {
    let mut lines = vec![format!(
        "{:<24} {:<4} {:>3} {:>8} {:>3} {:>3}  {}",
        "TIME", "ITF", "CHN", "ID", "IDE", "NOB", "DATA"
    )];
    for row in rows {
        lines.push(format!(
            "{:<24} {:<4} {:>3} {:>8X} {:>3} {:>3}  {}",
            format_epoch_ms(row.time_ms),
            row.interface.to_string(),
            row.channel,
            row.id,
            u8::from(row.is_extended),
            row.length,
            row.data
        ));
    }
    lines
}

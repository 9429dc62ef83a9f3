//! Fixed 7-column CSV form of stored snapshots.

use crate::storage::SnapshotRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write as _;

pub const HEADER: &str = "Timestamp,CpuTemp,CpuUsage,GpuTemp,GpuUsage,MemUsage,TotalPower";

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// `f64` Display is the shortest string that parses back to the same value
/// and never uses a locale separator.
pub fn serialize(records: &[SnapshotRecord]) -> String {
    let mut out = String::with_capacity(HEADER.len() + 1 + records.len() * 96);
    out.push_str(HEADER);
    out.push('\n');
    for r in records {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{}",
            format_timestamp(&r.timestamp),
            r.cpu_temp,
            r.cpu_usage,
            r.gpu_temp,
            r.gpu_usage,
            r.mem_usage,
            r.total_power
        );
    }
    out
}

/// Reads back what `serialize` wrote. The first line is always treated as
/// the header; blank lines and rows that are not exactly 7 parseable fields
/// are dropped. Records carry id 0.
pub fn deserialize(text: &str) -> Vec<SnapshotRecord> {
    text.lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_row)
        .collect()
}

fn parse_row(line: &str) -> Option<SnapshotRecord> {
    let fields: Vec<&str> = line.trim_end_matches('\r').split(',').collect();
    if fields.len() != 7 {
        return None;
    }
    let num = |i: usize| fields[i].trim().parse::<f64>().ok();

    Some(SnapshotRecord {
        id: 0,
        timestamp: DateTime::parse_from_rfc3339(fields[0].trim())
            .ok()?
            .with_timezone(&Utc),
        cpu_temp: num(1)?,
        cpu_usage: num(2)?,
        gpu_temp: num(3)?,
        gpu_usage: num(4)?,
        mem_usage: num(5)?,
        total_power: num(6)?,
    })
}

//! Machine-log line parser.
//!
//! Each line is `timestamp \t step \t frame,G,strip,v1,v2,...`. Lines with fewer than three
//! tab-separated fields, or whose timestamp has no date/time separator, are skipped. File order
//! is preserved.

use std::io;
use std::path::Path;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::reader::read_latin1;
use crate::table::parse_datetime;
use crate::types::LogEvent;

/// Timestamp layouts written by the machine controllers.
const LOG_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S%.f",
    "%Y/%m/%d %H:%M",
];

/// Stateless line parser; holds only the compiled frame-id pattern.
#[derive(Clone, Debug)]
pub struct LogParser {
    frame_pattern: Regex,
}

impl LogParser {
    /// Frame ids are one of `prefixes` followed by four word characters.
    pub fn new(prefixes: &[String]) -> Result<Self, regex::Error> {
        let alternation = prefixes
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        let frame_pattern = Regex::new(&format!(r"({alternation})(\w{{4}})"))?;
        Ok(Self { frame_pattern })
    }

    /// First frame id found in `raw`, or an empty string.
    pub fn frame_id(&self, raw: &str) -> String {
        self.frame_pattern
            .find(raw)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }

    pub fn parse_line(&self, line_no: usize, line: &str) -> Option<LogEvent> {
        let parts: Vec<&str> = line.trim().split('\t').collect();
        if parts.len() < 3 {
            return None;
        }
        let (date, time) = split_timestamp(parts[0])?;

        let fields: Vec<&str> = parts[2].split(',').collect();
        let field = |i: usize| fields.get(i).map(|s| s.trim()).filter(|s| !s.is_empty());

        let frame_id = field(0).map(|raw| self.frame_id(raw)).unwrap_or_default();
        let group = field(1).map(str::to_string);
        let strip_sequence = field(2).and_then(parse_sequence);
        let values = fields
            .iter()
            .skip(3)
            .map(|s| s.trim().parse::<f64>().ok().filter(|v| v.is_finite()))
            .collect();
        let timestamp = parse_log_timestamp(&date, &time);

        Some(LogEvent {
            line_no,
            date,
            time,
            step: parts[1].trim().to_string(),
            frame_id,
            group,
            strip_sequence,
            values,
            timestamp,
        })
    }

    pub fn parse_str(&self, text: &str) -> Vec<LogEvent> {
        text.lines()
            .enumerate()
            .filter_map(|(i, line)| self.parse_line(i + 1, line))
            .collect()
    }
}

/// Split at the first whitespace; strip AM/PM from the time without converting to 24-hour form.
fn split_timestamp(raw: &str) -> Option<(String, String)> {
    let (date, time) = raw.trim().split_once(char::is_whitespace)?;
    let time = time.replace("AM", "").replace("PM", "");
    Some((date.trim().to_string(), time.trim().to_string()))
}

/// Strip sequence numbers may be written as `1` or `1.0`.
fn parse_sequence(raw: &str) -> Option<i64> {
    let v: f64 = raw.parse().ok()?;
    (v.is_finite() && v.fract() == 0.0).then_some(v as i64)
}

fn parse_log_timestamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    let joined = format!("{date} {time}");
    LOG_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&joined, fmt).ok())
        .or_else(|| parse_datetime(&joined))
}

// ── Main parse function ─────────────────────────────────────────────

/// Parse a machine log (plain text or `.gz`).
pub fn parse_log<P: AsRef<Path>>(path: P, parser: &LogParser) -> io::Result<Vec<LogEvent>> {
    let text = read_latin1(path.as_ref())?;
    Ok(parser.parse_str(&text))
}

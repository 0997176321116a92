//! events: event-log input, submission output and timestamp strings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};

use crate::recognition::Jersey;

// ── Timestamps ───────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum TimestampError {
    #[error("invalid {field} in timestamp '{input}'")]
    InvalidField { field: &'static str, input: String },
    #[error("unrecognised timestamp '{0}'")]
    Malformed(String),
}

/// Seconds from `"mm:ss[.s]"`, `"hh:mm:ss[.s]"` or a bare number of seconds.
pub fn parse_timestamp(input: &str) -> Result<f64, TimestampError> {
    let trimmed = input.trim();
    let parts: Vec<&str> = trimmed.split(':').collect();

    let field = |field: &'static str, s: &str| -> Result<u64, TimestampError> {
        s.trim().parse::<u64>().map_err(|_| TimestampError::InvalidField {
            field,
            input: input.to_string(),
        })
    };
    let seconds = |s: &str| -> Result<f64, TimestampError> {
        match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
            _ => Err(TimestampError::InvalidField {
                field: "seconds",
                input: input.to_string(),
            }),
        }
    };

    match parts[..] {
        [m, s] => Ok(field("minutes", m)? as f64 * 60.0 + seconds(s)?),
        [h, m, s] => Ok(field("hours", h)? as f64 * 3600.0
            + field("minutes", m)? as f64 * 60.0
            + seconds(s)?),
        [bare] => match bare.parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
            _ => Err(TimestampError::Malformed(input.to_string())),
        },
        _ => Err(TimestampError::Malformed(input.to_string())),
    }
}

/// `"HH:MM:SS"` for whole seconds, `"HH:MM:SS.s"` otherwise.
///
/// Rounded to tenths before splitting, so 59.96 renders as `"00:01:00"`.
pub fn format_timestamp_hms(seconds: f64) -> String {
    let tenths = (seconds.max(0.0) * 10.0).round() as u64;
    let hours = tenths / 36_000;
    let minutes = (tenths % 36_000) / 600;
    let secs = (tenths % 600) / 10;
    match tenths % 10 {
        0 => format!("{hours:02}:{minutes:02}:{secs:02}"),
        frac => format!("{hours:02}:{minutes:02}:{secs:02}.{frac}"),
    }
}

// ── Event log ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Two roles: passer and receiver.
    Pass,
    Other,
}

impl EventKind {
    pub fn from_label(label: &str) -> Self {
        if label.trim().eq_ignore_ascii_case("pass") {
            EventKind::Pass
        } else {
            EventKind::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Seconds from the start of the video.
    pub timestamp: f64,
    /// Label exactly as it appears in the log.
    pub event: String,
}

impl EventRecord {
    pub fn kind(&self) -> EventKind {
        EventKind::from_label(&self.event)
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    timestamp: String,
    event: String,
}

/// Events that parsed, plus how many rows were dropped for a bad timestamp.
#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Vec<EventRecord>,
    pub skipped: usize,
}

pub fn read_events(path: &Path) -> Result<EventLog> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open event log {}", path.display()))?;
    let log = read_events_from(file)
        .with_context(|| format!("failed to read event log {}", path.display()))?;
    info!(
        path = %path.display(),
        events = log.events.len(),
        skipped = log.skipped,
        "event log loaded"
    );
    Ok(log)
}

/// Read a `timestamp,event` CSV.  A row whose timestamp does not parse is
/// logged and skipped; structural CSV errors abort.
pub fn read_events_from<R: io::Read>(reader: R) -> Result<EventLog> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut log = EventLog::default();
    for (row, record) in reader.deserialize::<RawEvent>().enumerate() {
        let raw = record.with_context(|| format!("malformed event row {}", row + 1))?;
        match parse_timestamp(&raw.timestamp) {
            Ok(timestamp) => log.events.push(EventRecord {
                timestamp,
                event: raw.event,
            }),
            Err(e) => {
                error!(row = row + 1, "skipping event: {e}");
                log.skipped += 1;
            }
        }
    }
    Ok(log)
}

// ── Submission ───────────────────────────────────────────────────────────────

/// One output line.  `receiver` is `NONE` for anything but a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRow {
    pub timestamp: String,
    pub event: String,
    pub player: String,
    pub receiver: String,
    pub latency: String,
}

impl SubmissionRow {
    pub fn new(
        record: &EventRecord,
        player: &Jersey,
        receiver: &Jersey,
        latency_secs: f64,
    ) -> Self {
        let receiver = match record.kind() {
            EventKind::Pass => receiver.to_string(),
            EventKind::Other => Jersey::None.to_string(),
        };
        Self {
            timestamp: format_timestamp_hms(record.timestamp),
            event: record.event.clone(),
            player: player.to_string(),
            receiver,
            latency: format!("{latency_secs:.3}"),
        }
    }
}

pub fn write_submission(path: &Path, rows: &[SubmissionRow]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_submission_to(file, rows)?;
    info!(path = %path.display(), rows = rows.len(), "submission written");
    Ok(())
}

pub fn write_submission_to<W: io::Write>(writer: W, rows: &[SubmissionRow]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    // Header even when there is nothing to report.
    if rows.is_empty() {
        writer
            .write_record(["timestamp", "event", "player", "receiver", "latency"])
            .context("failed to write submission header")?;
    }
    for row in rows {
        writer
            .serialize(row)
            .context("failed to write submission row")?;
    }
    writer.flush().context("failed to flush submission")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hms_round_trips_to_one_decimal() {
        let t = parse_timestamp("01:02:03.5").unwrap();
        assert_eq!(t, 3723.5);
        assert_eq!(format_timestamp_hms(t), "01:02:03.5");
    }

    #[test]
    fn minutes_and_seconds() {
        assert_eq!(parse_timestamp("12:30").unwrap(), 750.0);
        assert_eq!(parse_timestamp("0:07.5").unwrap(), 7.5);
    }

    #[test]
    fn bare_seconds_fall_back_to_float() {
        assert_eq!(parse_timestamp("42.25").unwrap(), 42.25);
        assert_eq!(parse_timestamp(" 5 ").unwrap(), 5.0);
    }

    #[test]
    fn malformed_timestamps_are_errors() {
        assert_eq!(
            parse_timestamp("1:2:3:4"),
            Err(TimestampError::Malformed("1:2:3:4".into()))
        );
        assert!(matches!(
            parse_timestamp("aa:10"),
            Err(TimestampError::InvalidField { field: "minutes", .. })
        ));
        assert!(matches!(
            parse_timestamp("00:00:xx"),
            Err(TimestampError::InvalidField { field: "seconds", .. })
        ));
        assert!(parse_timestamp("").is_err());
        assert!(parse_timestamp("soon").is_err());
    }

    #[test]
    fn whole_seconds_have_no_fraction() {
        assert_eq!(format_timestamp_hms(5.0), "00:00:05");
        assert_eq!(format_timestamp_hms(3661.0), "01:01:01");
        assert_eq!(format_timestamp_hms(65.5), "00:01:05.5");
    }

    #[test]
    fn rounding_carries_into_minutes_and_hours() {
        assert_eq!(format_timestamp_hms(59.96), "00:01:00");
        assert_eq!(format_timestamp_hms(3599.97), "01:00:00");
        assert_eq!(format_timestamp_hms(7.04), "00:00:07");
        assert_eq!(format_timestamp_hms(7.06), "00:00:07.1");
    }

    #[test]
    fn event_kind_is_case_insensitive() {
        assert_eq!(EventKind::from_label("PASS"), EventKind::Pass);
        assert_eq!(EventKind::from_label("Pass"), EventKind::Pass);
        assert_eq!(EventKind::from_label("Shot"), EventKind::Other);
        assert_eq!(EventKind::from_label("passing"), EventKind::Other);
    }

    #[test]
    fn bad_rows_are_skipped_and_counted() {
        let csv = "timestamp,event\n00:00:05,Shot\nlater,Pass\n01:10.5,pass\n";
        let log = read_events_from(csv.as_bytes()).unwrap();
        assert_eq!(log.skipped, 1);
        assert_eq!(log.events.len(), 2);
        assert_eq!(log.events[1].timestamp, 70.5);
        assert_eq!(log.events[1].kind(), EventKind::Pass);
    }

    #[test]
    fn missing_column_is_a_hard_error() {
        let csv = "time,label\n00:00:05,Shot\n";
        assert!(read_events_from(csv.as_bytes()).is_err());
    }

    #[test]
    fn receiver_is_none_outside_passes() {
        let shot = EventRecord {
            timestamp: 5.0,
            event: "Shot".into(),
        };
        let row = SubmissionRow::new(
            &shot,
            &Jersey::Number("9".into()),
            &Jersey::Number("4".into()),
            0.12345,
        );
        assert_eq!(row.timestamp, "00:00:05");
        assert_eq!(row.player, "9");
        assert_eq!(row.receiver, "NONE");
        assert_eq!(row.latency, "0.123");
    }

    #[test]
    fn submission_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("submission.csv");
        let pass = EventRecord {
            timestamp: 3723.5,
            event: "Pass".into(),
        };
        let rows = vec![SubmissionRow::new(
            &pass,
            &Jersey::Number("7".into()),
            &Jersey::Number("10".into()),
            1.5,
        )];
        write_submission(&path, &rows).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "timestamp,event,player,receiver,latency\n01:02:03.5,Pass,7,10,1.500\n"
        );

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let back: Vec<SubmissionRow> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(back, rows);
    }

    #[test]
    fn empty_submission_still_has_header() {
        let mut out = Vec::new();
        write_submission_to(&mut out, &[]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "timestamp,event,player,receiver,latency\n"
        );
    }
}

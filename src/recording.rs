//! Tabular recording format
//!
//! Recordings are written by the headset vendor's desktop recorder:
//!
//! ```text
//! Session start time,12:30:45
//! Mark,Minutes,Seconds,IAPF,IAF,...
//! 0,0m,1s,10.1,9.8,...,62.4,...
//! ...
//! Session stop time,12:45:10
//! ```
//!
//! Data rows carry at least [`MIN_COLUMNS`] CSV fields. Column 1 is
//! `<minutes>m`, column 2 is `<seconds>s`, the metrics sit at fixed positions
//! listed in [`METRIC_COLUMNS`]. Rows whose first field starts with one of
//! [`MARKER_PREFIXES`] are metadata. A column header is only recognised as
//! the first non-marker row.

use crate::error::FocusError;
use crate::types::{MetricBundle, MetricEvent, SessionId, SessionMarker, CONCENTRATION_FIELD};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Serialize;

/// Minimum number of fields in a data row
pub const MIN_COLUMNS: usize = 29;

/// Column holding the concentration value
pub const CONCENTRATION_COLUMN: usize = 10;

/// Largest accepted value of the minutes or seconds column
pub const MAX_TIME_FIELD: f64 = 10_000_000.0;

/// Auxiliary metric columns by position
pub const METRIC_COLUMNS: &[(usize, &str)] = &[
    (3, "iapf"),
    (4, "iaf"),
    (6, "fatigue_score"),
    (8, "alpha_gravity"),
    (9, "baseline_concentration"),
    (12, "relaxation_index"),
    (15, "heart_rate"),
    (16, "stress"),
    (19, "theta"),
    (20, "alpha"),
    (21, "beta"),
    (22, "theta_peak"),
    (23, "alpha_peak"),
    (24, "beta_peak"),
    (25, "relaxation"),
    (26, "cognitive_load"),
    (27, "attention"),
    (28, "cognitive_control"),
];

/// First-field prefixes of metadata rows
pub const MARKER_PREFIXES: &[&str] = &["Session", "IAPF Calibration", "Baseline Calibration"];

/// Auxiliary key holding the row's offset from the start of the recording
pub const ELAPSED_FIELD: &str = "elapsed_seconds";

/// Auxiliary key holding the numeric mark column
pub const MARK_FIELD: &str = "mark";

/// One parsed data row
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRow {
    pub mark: Option<f64>,
    /// Seconds since the recording started
    pub elapsed_secs: f64,
    /// Concentration plus every non-empty metric column
    pub metrics: MetricBundle,
}

impl RecordRow {
    pub fn concentration(&self) -> f64 {
        self.metrics.get(CONCENTRATION_FIELD).copied().unwrap_or_default()
    }

    /// Turn the row into an event anchored at `anchor`
    pub fn into_event(
        self,
        session_id: SessionId,
        sequence_number: u64,
        anchor: DateTime<Utc>,
    ) -> Result<MetricEvent, FocusError> {
        let timestamp = ChronoDuration::try_milliseconds((self.elapsed_secs * 1000.0) as i64)
            .and_then(|offset| anchor.checked_add_signed(offset))
            .ok_or_else(|| {
                FocusError::MalformedRecord(format!(
                    "elapsed time {}s is out of range",
                    self.elapsed_secs
                ))
            })?;
        let mut bundle = self.metrics;
        bundle.insert(ELAPSED_FIELD.to_string(), self.elapsed_secs);
        if let Some(mark) = self.mark {
            bundle.insert(MARK_FIELD.to_string(), mark);
        }
        MetricEvent::from_bundle(session_id, sequence_number, timestamp, bundle)
    }
}

/// Classification of a single row
#[derive(Debug, Clone, PartialEq)]
pub enum RecordLine {
    Blank,
    /// Column header row
    Header,
    /// Metadata row; carries a marker when it announces a start or stop time
    Marker(Option<SessionMarker>),
    Data(RecordRow),
}

fn reader_builder() -> ReaderBuilder {
    let mut builder = ReaderBuilder::new();
    builder.has_headers(false).flexible(true).trim(Trim::All);
    builder
}

/// Split one line into CSV fields
fn split_line(line: &str) -> Result<StringRecord, FocusError> {
    let mut reader = reader_builder().from_reader(line.as_bytes());
    let mut record = StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => Ok(record),
        Ok(false) => Ok(StringRecord::new()),
        Err(e) => Err(FocusError::MalformedRecord(e.to_string())),
    }
}

/// Row classifier for one recording.
///
/// Tracks whether the header slot is still open: only the first row that is
/// neither blank nor a marker may be a column header. Later rows that do not
/// parse as data are malformed.
#[derive(Debug, Clone, Default)]
pub struct LineParser {
    header_closed: bool,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a data row or header has already been seen
    pub fn header_closed(&self) -> bool {
        self.header_closed
    }

    /// Reopen the header slot, e.g. after the file was truncated
    pub fn reset(&mut self) {
        self.header_closed = false;
    }

    /// Parse one line of a recording
    pub fn parse_line(&mut self, line: &str) -> Result<RecordLine, FocusError> {
        let record = split_line(line)?;
        self.parse_record(&record)
    }

    /// Classify one CSV record.
    ///
    /// Returns `MalformedRecord` for rows with too few columns, a bad time pair
    /// or non-numeric metric fields.
    pub fn parse_record(&mut self, record: &StringRecord) -> Result<RecordLine, FocusError> {
        if record.iter().all(str::is_empty) {
            return Ok(RecordLine::Blank);
        }

        let first = &record[0];
        if MARKER_PREFIXES.iter().any(|prefix| first.starts_with(prefix)) {
            return Ok(RecordLine::Marker(parse_marker(record)));
        }

        let header_allowed = !self.header_closed;
        self.header_closed = true;

        if record.len() < MIN_COLUMNS {
            return Err(FocusError::MalformedRecord(format!(
                "expected at least {} columns, found {}",
                MIN_COLUMNS,
                record.len()
            )));
        }

        if header_allowed && first.parse::<f64>().is_err() && !record[1].ends_with('m') {
            return Ok(RecordLine::Header);
        }

        let minutes = parse_unit(&record[1], 'm')?;
        let seconds = parse_unit(&record[2], 's')?;

        let concentration = parse_number(&record[CONCENTRATION_COLUMN], CONCENTRATION_FIELD)?
            .ok_or_else(|| FocusError::MalformedRecord("empty concentration field".to_string()))?;

        let mut metrics = MetricBundle::new();
        metrics.insert(CONCENTRATION_FIELD.to_string(), concentration);
        for (column, name) in METRIC_COLUMNS {
            if let Some(value) = parse_number(&record[*column], name)? {
                metrics.insert((*name).to_string(), value);
            }
        }

        Ok(RecordLine::Data(RecordRow {
            mark: first.parse::<f64>().ok(),
            elapsed_secs: minutes.trunc() * 60.0 + seconds.trunc(),
            metrics,
        }))
    }
}

fn parse_unit(field: &str, unit: char) -> Result<f64, FocusError> {
    let number = field.strip_suffix(unit).ok_or_else(|| {
        FocusError::MalformedRecord(format!("time field {:?} lacks '{}' suffix", field, unit))
    })?;
    number
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| (0.0..=MAX_TIME_FIELD).contains(v))
        .ok_or_else(|| FocusError::MalformedRecord(format!("invalid time field {:?}", field)))
}

fn parse_number(field: &str, name: &str) -> Result<Option<f64>, FocusError> {
    if field.is_empty() {
        return Ok(None);
    }
    match field.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(FocusError::MalformedRecord(format!(
            "non-numeric {} field {:?}",
            name, field
        ))),
    }
}

fn parse_marker(record: &StringRecord) -> Option<SessionMarker> {
    let label = record[0].to_ascii_lowercase();
    let time = record.iter().find_map(find_clock_time)?;
    if label.contains("start") {
        Some(SessionMarker::Started(time))
    } else if label.contains("stop") {
        Some(SessionMarker::Stopped(time))
    } else {
        None
    }
}

/// Find the first `HH:MM:SS` token in `text`
fn find_clock_time(text: &str) -> Option<NaiveTime> {
    let bytes = text.as_bytes();
    if bytes.len() < 8 {
        return None;
    }
    (0..=bytes.len() - 8).find_map(|start| {
        let window = text.get(start..start + 8)?;
        let shape_ok = window
            .bytes()
            .enumerate()
            .all(|(i, b)| if i == 2 || i == 5 { b == b':' } else { b.is_ascii_digit() });
        if !shape_ok {
            return None;
        }
        NaiveTime::parse_from_str(window, "%H:%M:%S").ok()
    })
}

/// A fully parsed recording
#[derive(Debug, Clone, Default)]
pub struct Recording {
    pub rows: Vec<RecordRow>,
    /// Markers in file order
    pub markers: Vec<SessionMarker>,
    /// Line number (1-based) and reason for every skipped row
    pub malformed: Vec<(usize, String)>,
    pub metadata_rows: usize,
}

impl Recording {
    /// Parse a whole recording, skipping malformed rows
    pub fn parse(text: &str) -> Self {
        Self::parse_with(text, &mut LineParser::new())
    }

    /// Parse `text` with an existing classifier, leaving its header state
    /// where the text ends
    pub fn parse_with(text: &str, parser: &mut LineParser) -> Self {
        let mut recording = Recording::default();
        let mut reader = reader_builder().from_reader(text.as_bytes());
        let mut record = StringRecord::new();
        loop {
            match reader.read_record(&mut record) {
                Ok(false) => break,
                Ok(true) => {
                    let line = record.position().map(|p| p.line() as usize).unwrap_or_default();
                    match parser.parse_record(&record) {
                        Ok(RecordLine::Data(row)) => recording.rows.push(row),
                        Ok(RecordLine::Marker(marker)) => {
                            recording.metadata_rows += 1;
                            recording.markers.extend(marker);
                        }
                        Ok(RecordLine::Header) | Ok(RecordLine::Blank) => {}
                        Err(e) => recording.malformed.push((line, e.to_string())),
                    }
                }
                Err(e) => {
                    let line = e.position().map(|p| p.line() as usize).unwrap_or_default();
                    let fatal = e.is_io_error();
                    recording.malformed.push((line, e.to_string()));
                    if fatal {
                        break;
                    }
                }
            }
        }
        recording
    }

    pub fn start_time(&self) -> Option<NaiveTime> {
        self.markers.iter().find_map(|m| match m {
            SessionMarker::Started(t) => Some(*t),
            _ => None,
        })
    }

    pub fn stop_time(&self) -> Option<NaiveTime> {
        self.markers.iter().rev().find_map(|m| match m {
            SessionMarker::Stopped(t) => Some(*t),
            _ => None,
        })
    }

    pub fn report(&self) -> RecordingReport {
        let values: Vec<f64> = self.rows.iter().map(RecordRow::concentration).collect();
        let mean = if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        };
        RecordingReport {
            data_rows: self.rows.len(),
            malformed_rows: self.malformed.len(),
            metadata_rows: self.metadata_rows,
            session_start: self.start_time().map(|t| t.to_string()),
            session_stop: self.stop_time().map(|t| t.to_string()),
            duration_secs: self.rows.last().map(|r| r.elapsed_secs).unwrap_or_default(),
            mean_concentration: mean,
            errors: self
                .malformed
                .iter()
                .map(|(line, reason)| format!("line {}: {}", line, reason))
                .collect(),
        }
    }
}

/// Summary of a recording, as printed by `focus validate`
#[derive(Debug, Clone, Serialize)]
pub struct RecordingReport {
    pub data_rows: usize,
    pub malformed_rows: usize,
    pub metadata_rows: usize,
    pub session_start: Option<String>,
    pub session_stop: Option<String>,
    pub duration_secs: f64,
    pub mean_concentration: Option<f64>,
    pub errors: Vec<String>,
}

/// Anchor timestamp for relative row times.
///
/// Uses the recording's start marker on the current UTC date when known,
/// otherwise `fallback`.
pub fn anchor_time(start: Option<NaiveTime>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    match start {
        Some(time) => fallback.date_naive().and_time(time).and_utc(),
        None => fallback,
    }
}

/// Build a data row in the recorder's layout. Used by tests and fixtures.
pub fn format_row(minutes: u32, seconds: u32, concentration: f64, heart_rate: f64) -> String {
    let mut fields = vec![String::new(); MIN_COLUMNS];
    fields[0] = "0".to_string();
    fields[1] = format!("{}m", minutes);
    fields[2] = format!("{}s", seconds);
    fields[CONCENTRATION_COLUMN] = format!("{}", concentration);
    fields[15] = format!("{}", heart_rate);
    fields[20] = "0.42".to_string();
    fields.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(line: &str) -> Result<RecordLine, FocusError> {
        LineParser::new().parse_line(line)
    }

    fn header() -> String {
        let mut names: Vec<String> = (0..MIN_COLUMNS).map(|i| format!("Col{}", i)).collect();
        names[0] = "Mark".to_string();
        names[1] = "Minutes".to_string();
        names.join(",")
    }

    #[test]
    fn test_parse_data_row() {
        let line = format_row(2, 15, 64.5, 71.0);
        let RecordLine::Data(row) = parse(&line).unwrap() else {
            panic!("expected data row");
        };
        assert_eq!(row.elapsed_secs, 135.0);
        assert_eq!(row.concentration(), 64.5);
        assert_eq!(row.metrics.get("heart_rate"), Some(&71.0));
        assert_eq!(row.metrics.get("alpha"), Some(&0.42));
        // empty columns are omitted rather than defaulted
        assert!(!row.metrics.contains_key("stress"));
        assert_eq!(row.mark, Some(0.0));
    }

    #[test]
    fn test_malformed_rows() {
        assert!(parse("1,2,3").is_err());

        let bad_time = format_row(1, 1, 50.0, 60.0).replacen("1m", "1x", 1);
        assert!(matches!(parse(&bad_time), Err(FocusError::MalformedRecord(_))));

        let bad_metric = format_row(1, 1, 50.0, 60.0).replace("50,", "fifty,");
        assert!(parse(&bad_metric).is_err());

        let mut fields: Vec<String> = format_row(1, 1, 50.0, 60.0)
            .split(',')
            .map(String::from)
            .collect();
        fields[CONCENTRATION_COLUMN] = String::new();
        assert!(parse(&fields.join(",")).is_err());
    }

    #[test]
    fn test_markers_and_header() {
        assert_eq!(
            parse("Session start time,12:30:45").unwrap(),
            RecordLine::Marker(Some(SessionMarker::Started(
                NaiveTime::from_hms_opt(12, 30, 45).unwrap()
            )))
        );
        assert_eq!(
            parse("Session stop time, 13:00:01").unwrap(),
            RecordLine::Marker(Some(SessionMarker::Stopped(
                NaiveTime::from_hms_opt(13, 0, 1).unwrap()
            )))
        );
        assert_eq!(
            parse("IAPF Calibration,done").unwrap(),
            RecordLine::Marker(None)
        );
        assert_eq!(parse(&header()).unwrap(), RecordLine::Header);
        assert_eq!(parse("   ").unwrap(), RecordLine::Blank);
    }

    #[test]
    fn test_parse_recording() {
        let text = [
            "Session start time,09:00:00".to_string(),
            header(),
            format_row(0, 1, 60.0, 70.0),
            "broken,row".to_string(),
            format_row(0, 2, 40.0, 72.0),
            "Session stop time,09:00:03".to_string(),
        ]
        .join("\n");

        let recording = Recording::parse(&text);
        assert_eq!(recording.rows.len(), 2);
        assert_eq!(recording.malformed.len(), 1);
        assert_eq!(recording.malformed[0].0, 4);
        assert_eq!(recording.start_time(), NaiveTime::from_hms_opt(9, 0, 0));
        assert_eq!(recording.stop_time(), NaiveTime::from_hms_opt(9, 0, 3));

        let report = recording.report();
        assert_eq!(report.data_rows, 2);
        assert_eq!(report.metadata_rows, 2);
        assert_eq!(report.mean_concentration, Some(50.0));
        assert_eq!(report.duration_secs, 2.0);
    }

    #[test]
    fn test_row_into_event() {
        let RecordLine::Data(row) = parse(&format_row(1, 0, 55.0, 80.0)).unwrap() else {
            panic!("expected data row");
        };
        let anchor = anchor_time(
            NaiveTime::from_hms_opt(10, 0, 0),
            "2024-03-01T08:00:00Z".parse().unwrap(),
        );
        let event = row.into_event(4, 9, anchor).unwrap();
        assert_eq!(event.session_id, 4);
        assert_eq!(event.sequence_number, 9);
        assert_eq!(event.concentration, 55.0);
        assert_eq!(event.auxiliary.get(ELAPSED_FIELD), Some(&60.0));
        assert_eq!(event.timestamp.to_rfc3339(), "2024-03-01T10:01:00+00:00");
    }

    #[test]
    fn test_quoted_fields() {
        let quoted = format_row(0, 1, 62.5, 70.0)
            .split(',')
            .map(|field| format!("\"{}\"", field))
            .collect::<Vec<_>>()
            .join(",");
        let RecordLine::Data(row) = parse(&quoted).unwrap() else {
            panic!("expected data row");
        };
        assert_eq!(row.concentration(), 62.5);
        assert_eq!(row.elapsed_secs, 1.0);

        let mut fields: Vec<String> = format_row(0, 2, 50.0, 70.0)
            .split(',')
            .map(String::from)
            .collect();
        fields[5] = "\"note, with comma\"".to_string();
        let RecordLine::Data(row) = parse(&fields.join(",")).unwrap() else {
            panic!("expected data row");
        };
        assert_eq!(row.concentration(), 50.0);
    }

    #[test]
    fn test_header_only_before_first_row() {
        let mut parser = LineParser::new();
        assert_eq!(
            parser.parse_line("Session start time,09:00:00").unwrap(),
            RecordLine::Marker(Some(SessionMarker::Started(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap()
            )))
        );
        assert!(!parser.header_closed());
        assert_eq!(parser.parse_line(&header()).unwrap(), RecordLine::Header);
        assert!(matches!(parser.parse_line(&format_row(0, 1, 60.0, 70.0)), Ok(RecordLine::Data(_))));
        assert!(matches!(parser.parse_line(&header()), Err(FocusError::MalformedRecord(_))));

        parser.reset();
        assert_eq!(parser.parse_line(&header()).unwrap(), RecordLine::Header);

        let text = [format_row(0, 1, 60.0, 70.0), header(), format_row(0, 2, 61.0, 70.0)].join("\n");
        let recording = Recording::parse(&text);
        assert_eq!(recording.rows.len(), 2);
        assert_eq!(recording.malformed.len(), 1);
        assert_eq!(recording.malformed[0].0, 2);
    }

    #[test]
    fn test_out_of_range_time_is_malformed() {
        let huge = format_row(0, 1, 50.0, 60.0).replacen("0m", "1e12m", 1);
        assert!(matches!(parse(&huge), Err(FocusError::MalformedRecord(_))));
        let negative = format_row(0, 1, 50.0, 60.0).replacen("1s", "-1s", 1);
        assert!(matches!(parse(&negative), Err(FocusError::MalformedRecord(_))));

        let text = [format_row(0, 1, 70.0, 60.0), huge, format_row(0, 2, 65.0, 60.0)].join("\n");
        let recording = Recording::parse(&text);
        let values: Vec<f64> = recording.rows.iter().map(RecordRow::concentration).collect();
        assert_eq!(values, vec![70.0, 65.0]);
        assert_eq!(recording.malformed.len(), 1);

        let row = RecordRow {
            mark: None,
            elapsed_secs: 1e15,
            metrics: [(CONCENTRATION_FIELD.to_string(), 50.0)].into_iter().collect(),
        };
        assert!(matches!(
            row.into_event(1, 1, Utc::now()),
            Err(FocusError::MalformedRecord(_))
        ));
    }
}

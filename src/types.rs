//! Core types for the Rhythm HRV pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: raw sensor readings grouped in a frame, watermarks, annotated
//! readings, and the row shape handed to persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;
use crate::timestamp::seconds_between;

/// Named columns of a reading frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Heartbeat,
    Device,
    TimestampStr,
    NextTimestampStr,
    TimeGapSeconds,
    StartTimestamp,
    EndTimestamp,
}

impl Column {
    pub fn as_str(&self) -> &'static str {
        match self {
            Column::Heartbeat => "heartbeat",
            Column::Device => "device",
            Column::TimestampStr => "timestamp_str",
            Column::NextTimestampStr => "next_timestamp_str",
            Column::TimeGapSeconds => "time_gap_seconds",
            Column::StartTimestamp => "start_timestamp",
            Column::EndTimestamp => "end_timestamp",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Columns of a raw `Rhythm*.csv` object, in file order
pub const RAW_COLUMNS: [Column; 5] = [
    Column::Heartbeat,
    Column::Device,
    Column::TimestampStr,
    Column::NextTimestampStr,
    Column::TimeGapSeconds,
];

/// Every column a fully parsed frame carries
pub const FRAME_COLUMNS: [Column; 7] = [
    Column::Heartbeat,
    Column::Device,
    Column::TimestampStr,
    Column::NextTimestampStr,
    Column::TimeGapSeconds,
    Column::StartTimestamp,
    Column::EndTimestamp,
];

/// One observed event window for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Opaque device identifier
    #[serde(rename = "device")]
    pub device_id: String,
    /// Signal count for the window; 0 means no signal
    pub heartbeat: i64,
    /// Event timestamp as received
    pub timestamp_str: String,
    /// Timestamp of the next event of the same device, as received
    pub next_timestamp_str: String,
    /// Parsed `timestamp_str` (None if unparseable)
    pub start_timestamp: Option<DateTime<Utc>>,
    /// Parsed `next_timestamp_str` (None if unparseable)
    pub end_timestamp: Option<DateTime<Utc>>,
    /// `end - start` in seconds
    pub time_gap_seconds: Option<f64>,
    /// True for rows manufactured by gap interpolation
    #[serde(default)]
    pub synthetic: bool,
}

impl SensorReading {
    /// Gap between this event and the next one, recomputed from the instants.
    pub fn computed_gap(&self) -> Option<f64> {
        match (&self.start_timestamp, &self.end_timestamp) {
            (Some(start), Some(end)) => seconds_between(start, end),
            _ => None,
        }
    }
}

/// An ordered set of readings plus the columns the upstream table carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingFrame {
    columns: Vec<Column>,
    readings: Vec<SensorReading>,
}

impl ReadingFrame {
    /// Frame with every column present
    pub fn new(readings: Vec<SensorReading>) -> Self {
        Self {
            columns: FRAME_COLUMNS.to_vec(),
            readings,
        }
    }

    /// Frame carrying only the given columns
    pub fn with_columns(columns: Vec<Column>, readings: Vec<SensorReading>) -> Self {
        Self { columns, readings }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn has_column(&self, column: Column) -> bool {
        self.columns.contains(&column)
    }

    /// Fail with `MissingColumn` unless `column` is present
    pub fn require(&self, column: Column) -> Result<(), ValidationError> {
        if self.has_column(column) {
            Ok(())
        } else {
            Err(ValidationError::MissingColumn(column))
        }
    }

    pub fn readings(&self) -> &[SensorReading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Column>, Vec<SensorReading>) {
        (self.columns, self.readings)
    }

    /// Distinct device ids in order of first appearance
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for reading in &self.readings {
            if !ids.iter().any(|id| id == &reading.device_id) {
                ids.push(reading.device_id.clone());
            }
        }
        ids
    }

    /// Sub-frame holding only `device_id`'s rows, columns preserved
    pub fn for_device(&self, device_id: &str) -> ReadingFrame {
        ReadingFrame {
            columns: self.columns.clone(),
            readings: self
                .readings
                .iter()
                .filter(|r| r.device_id == device_id)
                .cloned()
                .collect(),
        }
    }
}

/// Last ingested `start_timestamp` for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    /// Sentinel for "no watermark": accepts every reading
    pub const MIN: Watermark = Watermark(DateTime::<Utc>::MIN_UTC);

    pub fn new(instant: DateTime<Utc>) -> Self {
        Watermark(instant)
    }

    /// Missing instants collapse to the sentinel
    pub fn from_option(instant: Option<DateTime<Utc>>) -> Self {
        instant.map(Watermark).unwrap_or(Watermark::MIN)
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Watermark::MIN
    }

    /// Strictly newer than the watermark
    pub fn admits(&self, instant: &DateTime<Utc>) -> bool {
        *instant > self.0
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Watermark::MIN
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sentinel() {
            f.write_str("<none>")
        } else {
            write!(f, "{}", self.0.to_rfc3339())
        }
    }
}

/// A reading with its RR interval and rolling HRV attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedReading {
    #[serde(flatten)]
    pub reading: SensorReading,
    /// `timestamp_str` coerced to an instant
    pub timestamp: Option<DateTime<Utc>>,
    /// `next_timestamp_str` coerced to an instant
    pub next_timestamp: Option<DateTime<Utc>>,
    /// RR interval (ms)
    pub rr_interval_ms: Option<f64>,
    /// Rolling RMSSD over the last window of RR intervals (ms)
    pub hrv_rmssd: Option<f64>,
}

/// Annotated output for one device, same order as its interpolated input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedSeries {
    pub device_id: String,
    pub rows: Vec<AnnotatedReading>,
}

impl AnnotatedSeries {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn synthetic_count(&self) -> usize {
        self.rows.iter().filter(|r| r.reading.synthetic).count()
    }
}

/// Schema tag written with every persisted row
pub const ROW_SCHEMA_VERSION: &str = "rhythm.hrv_row.v1";

/// Row shape handed to persistence sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRow {
    pub schema_version: String,
    pub device: String,
    pub heartbeat: i64,
    pub timestamp_str: Option<DateTime<Utc>>,
    pub next_timestamp_str: Option<DateTime<Utc>>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub time_gap_seconds: Option<f64>,
    pub synthetic: bool,
    #[serde(rename = "RR_interval_ms")]
    pub rr_interval_ms: Option<f64>,
    #[serde(rename = "HRV_RMSSD")]
    pub hrv_rmssd: Option<f64>,
}

impl From<&AnnotatedReading> for PersistedRow {
    fn from(row: &AnnotatedReading) -> Self {
        PersistedRow {
            schema_version: ROW_SCHEMA_VERSION.to_string(),
            device: row.reading.device_id.clone(),
            heartbeat: row.reading.heartbeat,
            timestamp_str: row.timestamp,
            next_timestamp_str: row.next_timestamp,
            start_timestamp: row.reading.start_timestamp,
            end_timestamp: row.reading.end_timestamp,
            time_gap_seconds: row.reading.time_gap_seconds,
            synthetic: row.reading.synthetic,
            rr_interval_ms: row.rr_interval_ms,
            hrv_rmssd: row.hrv_rmssd,
        }
    }
}

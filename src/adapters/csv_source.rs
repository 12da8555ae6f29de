//! Raw-reading source backed by a local directory
//!
//! Each sub-directory of the root stands in for a bucket; objects are
//! headerless CSV files with the columns
//! `heartbeat, device, timestamp_str, next_timestamp_str, time_gap_seconds`.

use csv::{ReaderBuilder, StringRecord, Trim};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use super::{validate_identifier, ReadingSource};
use crate::error::{SourceError, SourceErrorKind};
use crate::timestamp::parse_timestamp;
use crate::types::{ReadingFrame, SensorReading, FRAME_COLUMNS, RAW_COLUMNS};

/// Object names must start with this prefix
pub const OBJECT_PREFIX: &str = "Rhythm";

/// Object names must end with this extension
pub const OBJECT_EXTENSION: &str = ".csv";

/// Field values treated as null
const NULL_TOKENS: [&str; 8] = ["", "NaN", "nan", "NA", "N/A", "null", "NULL", "None"];

/// Whether `name` matches `Rhythm*.csv`
pub fn is_rhythm_object(name: &str) -> bool {
    name.starts_with(OBJECT_PREFIX) && name.ends_with(OBJECT_EXTENSION)
}

/// Reads `Rhythm*.csv` objects from `<root>/<bucket>/<object>`
#[derive(Debug, Clone)]
pub struct CsvReadingSource {
    root: PathBuf,
}

impl CsvReadingSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Parse a CSV file at an arbitrary path, regardless of its name
    pub fn read_path(path: &Path) -> Result<ReadingFrame, SourceError> {
        let object = path.to_string_lossy();
        let file = File::open(path).map_err(|e| io_error(&object, e))?;
        Self::parse_reader(&object, file)
    }

    /// Parse headerless reading rows.
    ///
    /// Rows with a missing or null field are dropped. A non-numeric heartbeat
    /// or gap, or a row with extra fields, fails the whole object.
    pub fn parse_reader<R: Read>(object: &str, reader: R) -> Result<ReadingFrame, SourceError> {
        let mut csv_reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);

        let mut readings = Vec::new();
        let mut dropped = 0usize;

        for (index, result) in csv_reader.records().enumerate() {
            let record = result.map_err(|e| csv_error(object, e))?;
            match parse_record(&record) {
                Ok(Some(reading)) => readings.push(reading),
                Ok(None) => dropped += 1,
                Err(message) => {
                    return Err(SourceError::new(
                        object,
                        SourceErrorKind::Parse,
                        format!("line {}: {}", index + 1, message),
                    ));
                }
            }
        }

        if dropped > 0 {
            log::info!("Dropped {} rows with null fields from {}", dropped, object);
        }
        log::info!("Loaded {} readings from {}", readings.len(), object);
        Ok(ReadingFrame::with_columns(FRAME_COLUMNS.to_vec(), readings))
    }

    fn object_path(&self, bucket: &str, object: &str) -> Result<PathBuf, SourceError> {
        validate_identifier(bucket)
            .and_then(|_| validate_object_name(object))
            .map_err(|msg| SourceError::new(object, SourceErrorKind::InvalidName, msg))?;
        Ok(self.root.join(bucket).join(object))
    }
}

impl ReadingSource for CsvReadingSource {
    fn fetch(&self, bucket: &str, object: &str) -> Result<Option<ReadingFrame>, SourceError> {
        if !is_rhythm_object(object) {
            log::info!(
                "Skipping object {} as it does not match {}*{}",
                object,
                OBJECT_PREFIX,
                OBJECT_EXTENSION
            );
            return Ok(None);
        }

        let path = self.object_path(bucket, object)?;
        log::info!("Fetching object {} from bucket {}", object, bucket);
        let file = File::open(&path).map_err(|e| io_error(object, e))?;
        Self::parse_reader(object, file).map(Some)
    }
}

/// Object names may hold any character except path separators; they must
/// stay a single component inside the bucket.
fn validate_object_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("object name cannot be empty".to_string());
    }
    if name.starts_with('.') {
        return Err(format!("object name '{}' cannot start with '.'", name));
    }
    if name.contains(['/', '\\', '\0']) || name.contains("..") {
        return Err(format!("object name '{}' escapes its bucket", name));
    }
    Ok(())
}

fn is_null(field: &str) -> bool {
    NULL_TOKENS.contains(&field)
}

fn parse_record(record: &StringRecord) -> Result<Option<SensorReading>, String> {
    if record.len() > RAW_COLUMNS.len() {
        return Err(format!(
            "expected {} fields, found {}",
            RAW_COLUMNS.len(),
            record.len()
        ));
    }
    if record.len() < RAW_COLUMNS.len() || record.iter().any(is_null) {
        return Ok(None);
    }

    let heartbeat = parse_heartbeat(&record[0])?;
    let time_gap_seconds: f64 = record[4]
        .parse()
        .map_err(|_| format!("invalid time_gap_seconds '{}'", &record[4]))?;

    Ok(Some(SensorReading {
        device_id: record[1].to_string(),
        heartbeat,
        timestamp_str: record[2].to_string(),
        next_timestamp_str: record[3].to_string(),
        start_timestamp: parse_timestamp(&record[2]),
        end_timestamp: parse_timestamp(&record[3]),
        time_gap_seconds: Some(time_gap_seconds),
        synthetic: false,
    }))
}

/// Integer counts, also accepting integral floats such as `3.0`
fn parse_heartbeat(field: &str) -> Result<i64, String> {
    if let Ok(value) = field.parse::<i64>() {
        return Ok(value);
    }
    match field.parse::<f64>() {
        Ok(value) if value.fract() == 0.0 && value.is_finite() => Ok(value as i64),
        _ => Err(format!("invalid heartbeat '{}'", field)),
    }
}

fn io_error(object: &str, err: io::Error) -> SourceError {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => SourceErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => SourceErrorKind::Forbidden,
        _ => SourceErrorKind::Transient,
    };
    SourceError::new(object, kind, err.to_string())
}

fn csv_error(object: &str, err: csv::Error) -> SourceError {
    match err.into_kind() {
        csv::ErrorKind::Io(io_err) => io_error(object, io_err),
        other => SourceError::new(object, SourceErrorKind::Parse, format!("{:?}", other)),
    }
}

//! Collaborator adapters
//!
//! The pipeline core never touches storage directly. It talks to three
//! collaborators through the traits below:
//! - `ReadingSource` loads a raw `Rhythm*.csv` object into a reading frame
//! - `WatermarkSource` looks up a device's last ingested timestamp
//! - `PersistenceSink` writes an annotated series to a table
//!
//! Local implementations ship with the crate: a directory-backed CSV source, an
//! NDJSON table store, and an in-memory store for tests.

mod csv_source;
mod memory;
mod ndjson_store;

pub use csv_source::{is_rhythm_object, CsvReadingSource, OBJECT_EXTENSION, OBJECT_PREFIX};
pub use memory::InMemoryTableStore;
pub use ndjson_store::NdjsonTableStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{FetchError, LoadError, SourceError};
use crate::types::{AnnotatedSeries, ReadingFrame, Watermark};

/// Fully qualified target table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: &str, table: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            table: table.to_string(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// How a write treats rows already in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Add rows after the existing ones
    #[default]
    Append,
    /// Replace the table contents
    Truncate,
    /// Write only if the table holds no rows
    WriteEmpty,
}

/// Acknowledgement of a completed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReceipt {
    pub job_id: Uuid,
    pub table: TableRef,
    pub rows_written: usize,
}

/// Loads raw reading objects
pub trait ReadingSource {
    /// Fetch and parse `object` from `bucket`.
    ///
    /// Returns `Ok(None)` for objects whose name does not match the
    /// `Rhythm*.csv` pattern; those are skipped rather than rejected.
    fn fetch(&self, bucket: &str, object: &str) -> Result<Option<ReadingFrame>, SourceError>;
}

/// Looks up per-device watermarks
pub trait WatermarkSource {
    /// Maximum previously ingested `start_timestamp` for `device_id`, or
    /// `Watermark::MIN` when the device has no (valid) rows.
    fn fetch_watermark(&self, device_id: &str, table: &TableRef) -> Result<Watermark, FetchError>;
}

/// Writes annotated series
pub trait PersistenceSink {
    /// Write `series` to `table`. Empty series are a caller error.
    fn write(
        &mut self,
        series: &AnnotatedSeries,
        table: &TableRef,
        mode: WriteMode,
    ) -> Result<LoadReceipt, LoadError>;

    /// Remove every row of `table`, leaving it in place
    fn truncate(&mut self, table: &TableRef) -> Result<(), LoadError>;

    /// Whether `table` holds no rows (a table that does not exist yet is empty)
    fn is_empty(&self, table: &TableRef) -> Result<bool, LoadError>;
}

/// Maximum identifier length accepted in paths
const MAX_ID_LENGTH: usize = 256;

/// Check that `id` is safe to use as a single path component.
///
/// Only alphanumerics, `-`, `_` and `.` are allowed; empty ids, `.`/`..`
/// and ids starting with a dot are rejected.
pub(crate) fn validate_identifier(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("identifier cannot be empty".to_string());
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(format!(
            "identifier too long: {} (max: {})",
            id.len(),
            MAX_ID_LENGTH
        ));
    }
    if id.starts_with('.') {
        return Err(format!("identifier '{}' cannot start with '.'", id));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_' && *c != '.')
    {
        return Err(format!("invalid character '{}' in identifier '{}'", c, id));
    }
    Ok(())
}

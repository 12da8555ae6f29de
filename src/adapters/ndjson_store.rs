//! Append-only NDJSON table store
//!
//! Layout: `<root>/<dataset>/<table>.ndjson`, one `PersistedRow` per line.
//! A dataset is a directory that must exist before it can be read or written;
//! a table file is created on first write.

use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use uuid::Uuid;

use super::{
    validate_identifier, LoadReceipt, PersistenceSink, TableRef, WatermarkSource, WriteMode,
};
use crate::error::{FetchError, FetchErrorKind, LoadError, LoadErrorKind};
use crate::timestamp::parse_timestamp;
use crate::types::{AnnotatedSeries, PersistedRow, Watermark, ROW_SCHEMA_VERSION};

/// File-backed table store implementing both watermark lookup and writes
#[derive(Debug, Clone)]
pub struct NdjsonTableStore {
    root: PathBuf,
}

impl NdjsonTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the dataset directory if it does not exist yet
    pub fn create_dataset(&self, dataset: &str) -> io::Result<()> {
        validate_identifier(dataset)
            .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
        fs::create_dir_all(self.root.join(dataset))
    }

    pub fn table_path(&self, table: &TableRef) -> PathBuf {
        self.root
            .join(&table.dataset)
            .join(format!("{}.ndjson", table.table))
    }

    /// All rows of a table, in write order. A missing table file reads as empty.
    pub fn read_rows(&self, table: &TableRef) -> io::Result<Vec<PersistedRow>> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(&line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// First non-blank line of the table, if any
    fn first_line(&self, table: &TableRef) -> io::Result<Option<String>> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// Target ids must be present, path-safe, and name an existing dataset
    fn check_target(&self, table: &TableRef) -> Result<(), LoadError> {
        if table.dataset.is_empty() || table.table.is_empty() {
            log::error!("Dataset ID or Table ID is missing");
            return Err(LoadError::new(
                &table.dataset,
                &table.table,
                LoadErrorKind::MissingTarget,
                "dataset id or table id is missing",
            ));
        }

        validate_identifier(&table.dataset)
            .and_then(|_| validate_identifier(&table.table))
            .map_err(|msg| {
                LoadError::new(&table.dataset, &table.table, LoadErrorKind::MissingTarget, msg)
            })?;

        if !self.root.join(&table.dataset).is_dir() {
            return Err(LoadError::new(
                &table.dataset,
                &table.table,
                LoadErrorKind::NotFound,
                format!("dataset {} not found", table.dataset),
            ));
        }
        Ok(())
    }

    /// Append `bytes` with a single write
    fn append_table(&self, table: &TableRef, bytes: &[u8]) -> Result<(), LoadError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.table_path(table))
            .map_err(|e| load_io_error(table, e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_data())
            .map_err(|e| load_io_error(table, e))
    }

    /// Swap the table contents for `bytes` via a sibling temp file and rename
    fn replace_table(&self, table: &TableRef, bytes: &[u8]) -> Result<(), LoadError> {
        let path = self.table_path(table);
        let staging = path.with_extension("ndjson.tmp");
        fs::write(&staging, bytes)
            .and_then(|_| fs::rename(&staging, &path))
            .map_err(|e| {
                let _ = fs::remove_file(&staging);
                load_io_error(table, e)
            })
    }

    fn check_existing(&self, table: &TableRef, mode: WriteMode) -> Result<(), LoadError> {
        if mode == WriteMode::Truncate {
            return Ok(());
        }

        let first = self
            .first_line(table)
            .map_err(|e| load_io_error(table, e))?;
        let Some(line) = first else {
            return Ok(());
        };

        if mode == WriteMode::WriteEmpty {
            return Err(LoadError::new(
                &table.dataset,
                &table.table,
                LoadErrorKind::TableNotEmpty,
                "table already contains rows",
            ));
        }

        let version = serde_json::from_str::<Value>(&line)
            .ok()
            .and_then(|v| v.get("schema_version").and_then(Value::as_str).map(str::to_string));
        match version.as_deref() {
            Some(ROW_SCHEMA_VERSION) => Ok(()),
            other => Err(LoadError::new(
                &table.dataset,
                &table.table,
                LoadErrorKind::SchemaMismatch,
                format!(
                    "table schema {} does not match {}",
                    other.unwrap_or("<unknown>"),
                    ROW_SCHEMA_VERSION
                ),
            )),
        }
    }
}

impl WatermarkSource for NdjsonTableStore {
    fn fetch_watermark(&self, device_id: &str, table: &TableRef) -> Result<Watermark, FetchError> {
        log::info!(
            "Fetching max timestamp for device {} from {}",
            device_id,
            table
        );

        validate_identifier(&table.dataset)
            .and_then(|_| validate_identifier(&table.table))
            .map_err(|msg| FetchError::new(device_id, FetchErrorKind::MalformedQuery, msg))?;

        if !self.root.join(&table.dataset).is_dir() {
            return Err(FetchError::new(
                device_id,
                FetchErrorKind::NotFound,
                format!("dataset {} not found", table.dataset),
            ));
        }

        let path = self.table_path(table);
        if !path.exists() {
            log::warn!(
                "Table {} does not exist yet; no watermark for device {}",
                table,
                device_id
            );
            return Ok(Watermark::MIN);
        }

        let file = File::open(&path).map_err(|e| fetch_io_error(device_id, e))?;
        let mut latest = None;
        let mut invalid = 0usize;

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| fetch_io_error(device_id, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line).map_err(|e| {
                FetchError::new(
                    device_id,
                    FetchErrorKind::Unexpected,
                    format!("corrupt row at line {}: {}", index + 1, e),
                )
            })?;

            if value.get("device").and_then(Value::as_str) != Some(device_id) {
                continue;
            }
            match value
                .get("start_timestamp")
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
            {
                Some(start) => latest = latest.max(Some(start)),
                None => invalid += 1,
            }
        }

        if invalid > 0 {
            log::warn!(
                "Ignored {} rows without a valid start_timestamp for device {}",
                invalid,
                device_id
            );
        }

        let watermark = Watermark::from_option(latest);
        if watermark.is_sentinel() {
            log::warn!(
                "No valid timestamp found for device {}. Returning min timestamp.",
                device_id
            );
        } else {
            log::info!("Max timestamp for device {}: {}", device_id, watermark);
        }
        Ok(watermark)
    }
}

impl PersistenceSink for NdjsonTableStore {
    fn write(
        &mut self,
        series: &AnnotatedSeries,
        table: &TableRef,
        mode: WriteMode,
    ) -> Result<LoadReceipt, LoadError> {
        if series.is_empty() {
            log::warn!("Series for device {} is empty, no data to load", series.device_id);
            return Err(LoadError::new(
                &table.dataset,
                &table.table,
                LoadErrorKind::EmptyInput,
                "no data to load; series is empty",
            ));
        }

        self.check_target(table)?;
        self.check_existing(table, mode)?;

        // Serialize everything up front so the table only ever sees whole series
        let mut buffer = String::new();
        for row in &series.rows {
            let line = serde_json::to_string(&PersistedRow::from(row)).map_err(|e| {
                LoadError::new(
                    &table.dataset,
                    &table.table,
                    LoadErrorKind::Unexpected,
                    e.to_string(),
                )
            })?;
            buffer.push_str(&line);
            buffer.push('\n');
        }

        log::info!("Starting data load for {} rows into {}", series.len(), table);
        match mode {
            WriteMode::Truncate => self.replace_table(table, buffer.as_bytes())?,
            WriteMode::Append | WriteMode::WriteEmpty => {
                self.append_table(table, buffer.as_bytes())?
            }
        }

        let receipt = LoadReceipt {
            job_id: Uuid::new_v4(),
            table: table.clone(),
            rows_written: series.len(),
        };
        log::info!(
            "Data successfully loaded into {}. Job ID: {}",
            table,
            receipt.job_id
        );
        Ok(receipt)
    }

    fn truncate(&mut self, table: &TableRef) -> Result<(), LoadError> {
        self.check_target(table)?;
        log::info!("Truncating table {}", table);
        self.replace_table(table, &[])
    }

    fn is_empty(&self, table: &TableRef) -> Result<bool, LoadError> {
        self.check_target(table)?;
        self.first_line(table)
            .map(|line| line.is_none())
            .map_err(|e| load_io_error(table, e))
    }
}

fn fetch_io_error(device_id: &str, err: io::Error) -> FetchError {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => FetchErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => FetchErrorKind::Forbidden,
        _ => FetchErrorKind::Transient,
    };
    FetchError::new(device_id, kind, err.to_string())
}

fn load_io_error(table: &TableRef, err: io::Error) -> LoadError {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => LoadErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => LoadErrorKind::Forbidden,
        _ => LoadErrorKind::Transient,
    };
    LoadError::new(&table.dataset, &table.table, kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::*;
    use crate::types::AnnotatedReading;
    use tempfile::TempDir;

    fn series(device: &str, starts_ms: &[i64]) -> AnnotatedSeries {
        AnnotatedSeries {
            device_id: device.to_string(),
            rows: starts_ms
                .iter()
                .map(|start| AnnotatedReading {
                    reading: reading(device, *start, start + 1000, 1),
                    timestamp: Some(at_ms(*start)),
                    next_timestamp: Some(at_ms(start + 1000)),
                    rr_interval_ms: Some(1000.0),
                    hrv_rmssd: None,
                })
                .collect(),
        }
    }

    fn store_with_dataset() -> (TempDir, NdjsonTableStore, TableRef) {
        let dir = TempDir::new().unwrap();
        let store = NdjsonTableStore::new(dir.path());
        store.create_dataset("sensors").unwrap();
        (dir, store, TableRef::new("sensors", "hrv"))
    }

    #[test]
    fn test_watermark_without_table_is_sentinel() {
        let (_dir, store, table) = store_with_dataset();
        assert_eq!(store.fetch_watermark("S1", &table).unwrap(), Watermark::MIN);
    }

    #[test]
    fn test_watermark_is_max_start_for_device() {
        let (_dir, mut store, table) = store_with_dataset();
        store.write(&series("S1", &[0, 2000, 1000]), &table, WriteMode::Append).unwrap();
        store.write(&series("S2", &[9000]), &table, WriteMode::Append).unwrap();

        assert_eq!(
            store.fetch_watermark("S1", &table).unwrap(),
            Watermark::new(at_ms(2000))
        );
        assert_eq!(
            store.fetch_watermark("S2", &table).unwrap(),
            Watermark::new(at_ms(9000))
        );
        assert_eq!(store.fetch_watermark("S3", &table).unwrap(), Watermark::MIN);
    }

    #[test]
    fn test_watermark_ignores_unparseable_values() {
        let (_dir, store, table) = store_with_dataset();
        fs::write(
            store.table_path(&table),
            "{\"device\":\"S1\",\"start_timestamp\":\"soon\"}\n{\"device\":\"S1\"}\n",
        )
        .unwrap();
        assert_eq!(store.fetch_watermark("S1", &table).unwrap(), Watermark::MIN);
    }

    #[test]
    fn test_watermark_missing_dataset() {
        let dir = TempDir::new().unwrap();
        let store = NdjsonTableStore::new(dir.path());
        let err = store
            .fetch_watermark("S1", &TableRef::new("nowhere", "hrv"))
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::NotFound);
        assert_eq!(err.device_id, "S1");
    }

    #[test]
    fn test_watermark_malformed_table_id() {
        let (_dir, store, _) = store_with_dataset();
        let err = store
            .fetch_watermark("S1", &TableRef::new("sensors", "../etc"))
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::MalformedQuery);
    }

    #[test]
    fn test_append_accumulates_rows() {
        let (_dir, mut store, table) = store_with_dataset();
        let receipt = store.write(&series("S1", &[0, 1000]), &table, WriteMode::Append).unwrap();
        assert_eq!(receipt.rows_written, 2);
        store.write(&series("S1", &[2000]), &table, WriteMode::Append).unwrap();

        let rows = store.read_rows(&table).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.schema_version == ROW_SCHEMA_VERSION));
    }

    #[test]
    fn test_truncate_replaces_rows() {
        let (_dir, mut store, table) = store_with_dataset();
        store.write(&series("S1", &[0, 1000]), &table, WriteMode::Append).unwrap();
        store.write(&series("S2", &[0]), &table, WriteMode::Truncate).unwrap();

        let rows = store.read_rows(&table).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device, "S2");
    }

    #[test]
    fn test_write_empty_mode_rejects_populated_table() {
        let (_dir, mut store, table) = store_with_dataset();
        store.write(&series("S1", &[0]), &table, WriteMode::WriteEmpty).unwrap();
        let err = store
            .write(&series("S1", &[1000]), &table, WriteMode::WriteEmpty)
            .unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::TableNotEmpty);
    }

    #[test]
    fn test_empty_series_rejected() {
        let (_dir, mut store, table) = store_with_dataset();
        let err = store.write(&series("S1", &[]), &table, WriteMode::Append).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::EmptyInput);
    }

    #[test]
    fn test_missing_target_rejected() {
        let (_dir, mut store, _) = store_with_dataset();
        let err = store
            .write(&series("S1", &[0]), &TableRef::new("sensors", ""), WriteMode::Append)
            .unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::MissingTarget);
    }

    #[test]
    fn test_missing_dataset_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = NdjsonTableStore::new(dir.path());
        let err = store
            .write(&series("S1", &[0]), &TableRef::new("sensors", "hrv"), WriteMode::Append)
            .unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::NotFound);
        assert_eq!(err.dataset, "sensors");
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let (_dir, mut store, table) = store_with_dataset();
        fs::write(store.table_path(&table), "{\"schema_version\":\"legacy.v0\"}\n").unwrap();
        let err = store.write(&series("S1", &[0]), &table, WriteMode::Append).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_truncate_and_is_empty() {
        let (_dir, mut store, table) = store_with_dataset();
        assert!(store.is_empty(&table).unwrap());

        store.write(&series("S1", &[0, 1000]), &table, WriteMode::Append).unwrap();
        assert!(!store.is_empty(&table).unwrap());

        store.truncate(&table).unwrap();
        assert!(store.is_empty(&table).unwrap());
        assert!(store.table_path(&table).exists());
        assert_eq!(store.fetch_watermark("S1", &table).unwrap(), Watermark::MIN);
    }

    #[test]
    fn test_truncate_missing_dataset() {
        let dir = TempDir::new().unwrap();
        let mut store = NdjsonTableStore::new(dir.path());
        let err = store.truncate(&TableRef::new("sensors", "hrv")).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::NotFound);
    }

    #[test]
    fn test_truncating_write_leaves_no_staging_file() {
        let (dir, mut store, table) = store_with_dataset();
        store.write(&series("S1", &[0]), &table, WriteMode::Append).unwrap();
        store.write(&series("S2", &[0, 1000]), &table, WriteMode::Truncate).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path().join("sensors"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["hrv.ndjson".to_string()]);
        assert_eq!(store.read_rows(&table).unwrap().len(), 2);
    }

    #[test]
    fn test_append_writes_whole_series_in_order() {
        let (_dir, mut store, table) = store_with_dataset();
        store.write(&series("S1", &[4000, 0]), &table, WriteMode::Append).unwrap();

        let content = fs::read_to_string(store.table_path(&table)).unwrap();
        assert!(content.ends_with('\n'));
        let starts: Vec<_> = store
            .read_rows(&table)
            .unwrap()
            .into_iter()
            .map(|r| r.start_timestamp)
            .collect();
        assert_eq!(starts, vec![Some(at_ms(4000)), Some(t0())]);
    }
}

//! In-memory table store
//!
//! Mirrors `NdjsonTableStore` semantics without touching the filesystem, and
//! lets tests seed watermarks or inject per-device failures.

use std::collections::HashMap;
use uuid::Uuid;

use super::{LoadReceipt, PersistenceSink, TableRef, WatermarkSource, WriteMode};
use crate::error::{FetchError, FetchErrorKind, LoadError, LoadErrorKind};
use crate::types::{AnnotatedSeries, PersistedRow, Watermark};

#[derive(Debug, Clone, Default)]
pub struct InMemoryTableStore {
    tables: HashMap<TableRef, Vec<PersistedRow>>,
    seeded: HashMap<String, Watermark>,
    fetch_failures: HashMap<String, FetchErrorKind>,
    write_failures: HashMap<String, LoadErrorKind>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `watermark` for `device_id` regardless of stored rows
    pub fn with_watermark(mut self, device_id: &str, watermark: Watermark) -> Self {
        self.seeded.insert(device_id.to_string(), watermark);
        self
    }

    /// Fail every watermark lookup for `device_id`
    pub fn failing_fetch(mut self, device_id: &str, kind: FetchErrorKind) -> Self {
        self.fetch_failures.insert(device_id.to_string(), kind);
        self
    }

    /// Fail every write of `device_id`'s series
    pub fn failing_write(mut self, device_id: &str, kind: LoadErrorKind) -> Self {
        self.write_failures.insert(device_id.to_string(), kind);
        self
    }

    pub fn rows(&self, table: &TableRef) -> &[PersistedRow] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl WatermarkSource for InMemoryTableStore {
    fn fetch_watermark(&self, device_id: &str, table: &TableRef) -> Result<Watermark, FetchError> {
        if let Some(kind) = self.fetch_failures.get(device_id) {
            return Err(FetchError::new(device_id, *kind, "injected failure"));
        }
        if let Some(watermark) = self.seeded.get(device_id) {
            return Ok(*watermark);
        }

        let latest = self
            .rows(table)
            .iter()
            .filter(|row| row.device == device_id)
            .filter_map(|row| row.start_timestamp)
            .max();
        Ok(Watermark::from_option(latest))
    }
}

impl PersistenceSink for InMemoryTableStore {
    fn write(
        &mut self,
        series: &AnnotatedSeries,
        table: &TableRef,
        mode: WriteMode,
    ) -> Result<LoadReceipt, LoadError> {
        let fail = |kind: LoadErrorKind, message: &str| {
            Err(LoadError::new(&table.dataset, &table.table, kind, message))
        };

        if let Some(kind) = self.write_failures.get(&series.device_id) {
            return fail(*kind, "injected failure");
        }
        if series.is_empty() {
            return fail(LoadErrorKind::EmptyInput, "no data to load; series is empty");
        }
        if table.dataset.is_empty() || table.table.is_empty() {
            return fail(LoadErrorKind::MissingTarget, "dataset id or table id is missing");
        }

        let rows = self.tables.entry(table.clone()).or_default();
        match mode {
            WriteMode::Append => {}
            WriteMode::Truncate => rows.clear(),
            WriteMode::WriteEmpty if !rows.is_empty() => {
                return fail(LoadErrorKind::TableNotEmpty, "table already contains rows");
            }
            WriteMode::WriteEmpty => {}
        }
        rows.extend(series.rows.iter().map(PersistedRow::from));

        Ok(LoadReceipt {
            job_id: Uuid::new_v4(),
            table: table.clone(),
            rows_written: series.len(),
        })
    }

    fn truncate(&mut self, table: &TableRef) -> Result<(), LoadError> {
        if table.dataset.is_empty() || table.table.is_empty() {
            return Err(LoadError::new(
                &table.dataset,
                &table.table,
                LoadErrorKind::MissingTarget,
                "dataset id or table id is missing",
            ));
        }
        self.tables.entry(table.clone()).or_default().clear();
        Ok(())
    }

    fn is_empty(&self, table: &TableRef) -> Result<bool, LoadError> {
        Ok(self.rows(table).is_empty())
    }
}

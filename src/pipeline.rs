//! Pipeline orchestration
//!
//! This module provides the public API for Rhythm HRV.
//! It runs every device in a batch through the four stages and hands the
//! annotated series to persistence, isolating per-device failures.

use serde::Serialize;
use uuid::Uuid;

use crate::adapters::{PersistenceSink, ReadingSource, WatermarkSource, WriteMode};
use crate::config::{PipelineConfig, Settings};
use crate::context::StageContext;
use crate::error::{LoadError, LoadErrorKind, PipelineError};
use crate::filter::{TimeGapFilter, WatermarkFilter};
use crate::hrv::HrvAnnotator;
use crate::interpolator::GapInterpolator;
use crate::types::{AnnotatedSeries, ReadingFrame, Watermark};

/// Run one device's readings through the four stages, without any I/O.
///
/// Pipeline stages:
/// 1. TimeGapFilter - drop zero-signal rows and implausible gaps
/// 2. WatermarkFilter - keep rows newer than `watermark`
/// 3. GapInterpolator - fill missing one-second samples
/// 4. HrvAnnotator - RR intervals and rolling RMSSD
///
/// # Errors
/// `PipelineError::NoNewData` when nothing survives the watermark, and
/// `PipelineError::Validation` for structurally invalid frames.
///
/// # Example
/// ```ignore
/// let ctx = StageContext::new("S1");
/// let series = annotate_device(frame, Watermark::MIN, &ctx, &PipelineConfig::default())?;
/// ```
pub fn annotate_device(
    frame: ReadingFrame,
    watermark: Watermark,
    ctx: &StageContext,
    config: &PipelineConfig,
) -> Result<AnnotatedSeries, PipelineError> {
    // Stage 1: Gap and heartbeat filtering
    let filtered = TimeGapFilter::with_max_gap(config.max_gap_seconds).apply(frame, ctx)?;

    // Stage 2: Watermark
    let delta = WatermarkFilter::apply(filtered, watermark, ctx)?;

    // Stage 3: Interpolation
    let interpolated = GapInterpolator::interpolate(delta, ctx);

    // Stage 4: HRV annotation
    let annotated = HrvAnnotator::with_window(config.rmssd_window).annotate(interpolated, ctx)?;

    Ok(annotated)
}

/// What happened to one device in a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceOutcome {
    Persisted {
        device_id: String,
        rows: usize,
        synthetic_rows: usize,
        job_id: Uuid,
    },
    NoNewData {
        device_id: String,
    },
    Failed {
        device_id: String,
        error: String,
    },
}

impl DeviceOutcome {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceOutcome::Persisted { device_id, .. }
            | DeviceOutcome::NoNewData { device_id }
            | DeviceOutcome::Failed { device_id, .. } => device_id,
        }
    }
}

/// Per-device outcomes of one batch, in device first-appearance order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub outcomes: Vec<DeviceOutcome>,
}

impl BatchReport {
    pub fn persisted(&self) -> usize {
        self.count(|o| matches!(o, DeviceOutcome::Persisted { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, DeviceOutcome::NoNewData { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, DeviceOutcome::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    fn count(&self, pred: impl Fn(&DeviceOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

/// Batch processor wiring the stages to a watermark source and a sink.
///
/// Devices are processed one at a time; a device that fails or has no new
/// data never stops the devices after it.
pub struct RhythmProcessor<W, S> {
    watermarks: W,
    sink: S,
    settings: Settings,
    config: PipelineConfig,
}

impl<W: WatermarkSource, S: PersistenceSink> RhythmProcessor<W, S> {
    /// Create a processor with default stage tuning
    pub fn new(watermarks: W, sink: S, settings: Settings) -> Self {
        Self::with_config(watermarks, sink, settings, PipelineConfig::default())
    }

    pub fn with_config(watermarks: W, sink: S, settings: Settings, config: PipelineConfig) -> Self {
        Self {
            watermarks,
            sink,
            settings,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn watermarks(&self) -> &W {
        &self.watermarks
    }

    /// Fetch an object through `source` and process it.
    ///
    /// Returns `Ok(None)` when the source skipped the object by name.
    pub fn process_object<R: ReadingSource>(
        &mut self,
        source: &R,
        bucket: &str,
        object: &str,
    ) -> Result<Option<BatchReport>, PipelineError> {
        log::info!("File name: {}, Bucket name: {}", object, bucket);
        match source.fetch(bucket, object)? {
            Some(frame) => Ok(Some(self.process_frame(&frame))),
            None => Ok(None),
        }
    }

    /// Process every device in `frame`
    pub fn process_frame(&mut self, frame: &ReadingFrame) -> BatchReport {
        let run_id = Uuid::new_v4();
        let device_ids = frame.device_ids();
        log::info!(
            "Run {} processing {} rows across {} devices",
            run_id,
            frame.len(),
            device_ids.len()
        );

        let outcomes: Vec<DeviceOutcome> = if device_ids.is_empty() {
            Vec::new()
        } else {
            match self.prepare_table() {
                Ok(mode) => device_ids
                    .into_iter()
                    .map(|device_id| {
                        let ctx = StageContext::for_run(run_id, device_id);
                        let device_frame = frame.for_device(&ctx.device_id);
                        self.process_device(device_frame, &ctx, mode)
                    })
                    .collect(),
                Err(e) => {
                    log::error!("Run {} could not prepare the target table: {}", run_id, e);
                    let error = PipelineError::from(e).to_string();
                    device_ids
                        .into_iter()
                        .map(|device_id| DeviceOutcome::Failed {
                            device_id,
                            error: error.clone(),
                        })
                        .collect()
                }
            }
        };

        let report = BatchReport { run_id, outcomes };
        log::info!(
            "Run {} finished: {} persisted, {} without new data, {} failed",
            run_id,
            report.persisted(),
            report.skipped(),
            report.failed()
        );
        report
    }

    /// Apply the table-wide part of the write mode once per batch.
    ///
    /// Returns the mode each device write uses: truncating or checking for
    /// emptiness per device would discard or reject earlier devices' rows.
    fn prepare_table(&mut self) -> Result<WriteMode, LoadError> {
        let table = self.settings.table_ref();
        match self.config.write_mode {
            WriteMode::Append => {}
            WriteMode::Truncate => self.sink.truncate(&table)?,
            WriteMode::WriteEmpty => {
                if !self.sink.is_empty(&table)? {
                    return Err(LoadError::new(
                        &table.dataset,
                        &table.table,
                        LoadErrorKind::TableNotEmpty,
                        "table already contains rows",
                    ));
                }
            }
        }
        Ok(WriteMode::Append)
    }

    fn process_device(
        &mut self,
        frame: ReadingFrame,
        ctx: &StageContext,
        mode: WriteMode,
    ) -> DeviceOutcome {
        match self.run_device(frame, ctx, mode) {
            Ok(outcome) => outcome,
            Err(PipelineError::NoNewData { device_id }) => {
                log::info!("{} skipping device: no new data", ctx);
                DeviceOutcome::NoNewData { device_id }
            }
            Err(e) => {
                log::error!("{} device processing failed: {}", ctx, e);
                DeviceOutcome::Failed {
                    device_id: ctx.device_id.clone(),
                    error: e.to_string(),
                }
            }
        }
    }

    fn run_device(
        &mut self,
        frame: ReadingFrame,
        ctx: &StageContext,
        mode: WriteMode,
    ) -> Result<DeviceOutcome, PipelineError> {
        let table = self.settings.table_ref();
        let watermark = self.watermarks.fetch_watermark(&ctx.device_id, &table)?;
        log::debug!("{} watermark {}", ctx, watermark);

        let series = annotate_device(frame, watermark, ctx, &self.config)?;
        let receipt = self.sink.write(&series, &table, mode)?;

        Ok(DeviceOutcome::Persisted {
            device_id: ctx.device_id.clone(),
            rows: receipt.rows_written,
            synthetic_rows: series.synthetic_count(),
            job_id: receipt.job_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryTableStore, TableRef};
    use crate::adapters::CsvReadingSource;
    use crate::error::{FetchErrorKind, SourceErrorKind};
    use crate::types::fixtures::*;
    use crate::types::{Column, SensorReading};
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    const TWO_DEVICE_CSV: &str = "\
1,S1,2024-03-01 00:00:00.000000+0000,2024-03-01 00:00:01.000000+0000,1.0
1,S1,2024-03-01 00:00:01.000000+0000,2024-03-01 00:00:02.000000+0000,1.0
1,S2,2024-03-01 00:00:00.000000+0000,2024-03-01 00:00:01.000000+0000,1.0
";

    fn settings() -> Settings {
        Settings::new("sensors", "hrv")
    }

    fn table() -> TableRef {
        TableRef::new("sensors", "hrv")
    }

    fn ctx() -> StageContext {
        StageContext::new("S1")
    }

    /// `count` back-to-back one-second readings starting at `start_ms`
    fn steady(device: &str, start_ms: i64, count: i64) -> Vec<SensorReading> {
        (0..count)
            .map(|i| reading(device, start_ms + i * 1000, start_ms + (i + 1) * 1000, 1))
            .collect()
    }

    #[test]
    fn test_scenario_gap_pair_dropped() {
        // starts at 0s, 1s, 3s; the 1s->3s pair has a 2s gap
        let frame = ReadingFrame::new(vec![
            reading("S1", 0, 1000, 1),
            reading("S1", 1000, 3000, 1),
            reading("S1", 3000, 4000, 1),
        ]);
        let series =
            annotate_device(frame, Watermark::MIN, &ctx(), &PipelineConfig::default()).unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series.synthetic_count(), 0);
        let starts: Vec<i64> = series
            .rows
            .iter()
            .map(|r| (r.reading.start_timestamp.unwrap() - t0()).num_seconds())
            .collect();
        assert_eq!(starts, vec![0, 3]);
    }

    #[test]
    fn test_scenario_only_reading_gap_too_large() {
        let frame = ReadingFrame::new(vec![reading("S1", 0, 3200, 1)]);
        let err = annotate_device(frame, Watermark::MIN, &ctx(), &PipelineConfig::default())
            .unwrap_err();
        assert!(err.is_no_new_data());
    }

    #[test]
    fn test_scenario_watermark_equals_only_reading() {
        let frame = ReadingFrame::new(vec![reading("S1", 0, 1000, 1)]);
        let err = annotate_device(frame, Watermark::new(t0()), &ctx(), &PipelineConfig::default())
            .unwrap_err();
        match err {
            PipelineError::NoNewData { device_id } => assert_eq!(device_id, "S1"),
            other => panic!("expected NoNewData, got {other:?}"),
        }
    }

    #[test]
    fn test_gap_uses_natural_neighbour_before_watermark() {
        // The 2s gap row sits before the watermark; it is dropped by the gap
        // filter, not counted as new data
        let frame = ReadingFrame::new(vec![
            reading("S1", 0, 2000, 1),
            reading("S1", 2000, 3000, 1),
            reading("S1", 3000, 4000, 1),
        ]);
        let series =
            annotate_device(frame, Watermark::new(at_ms(2000)), &ctx(), &PipelineConfig::default())
                .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series.rows[0].reading.start_timestamp, Some(at_ms(3000)));
    }

    #[test]
    fn test_validation_error_propagates() {
        let frame = ReadingFrame::with_columns(
            vec![Column::Device, Column::StartTimestamp, Column::EndTimestamp],
            steady("S1", 0, 3),
        );
        let err = annotate_device(frame, Watermark::MIN, &ctx(), &PipelineConfig::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_long_series_gets_rmssd() {
        let frame = ReadingFrame::new(steady("S1", 0, 12));
        let series =
            annotate_device(frame, Watermark::MIN, &ctx(), &PipelineConfig::default()).unwrap();
        assert_eq!(series.len(), 12);
        assert!(series.rows[..9].iter().all(|r| r.hrv_rmssd.is_none()));
        assert!(series.rows[9..].iter().all(|r| r.hrv_rmssd == Some(0.0)));
    }

    #[test]
    fn test_batch_persists_each_device() {
        let mut readings = steady("S1", 0, 3);
        readings.extend(steady("S2", 500, 2));
        let frame = ReadingFrame::new(readings);

        let mut processor =
            RhythmProcessor::new(InMemoryTableStore::new(), InMemoryTableStore::new(), settings());
        let report = processor.process_frame(&frame);

        assert_eq!(report.persisted(), 2);
        assert!(!report.has_failures());
        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.device_id()).collect();
        assert_eq!(ids, vec!["S1", "S2"]);
        assert_eq!(processor.sink().rows(&table()).len(), 5);
    }

    #[test]
    fn test_no_new_data_skips_device_only() {
        let mut readings = steady("S1", 0, 3);
        readings.extend(steady("S2", 0, 3));
        let frame = ReadingFrame::new(readings);

        let watermarks =
            InMemoryTableStore::new().with_watermark("S1", Watermark::new(at_ms(5000)));
        let mut processor = RhythmProcessor::new(watermarks, InMemoryTableStore::new(), settings());
        let report = processor.process_frame(&frame);

        assert_eq!(
            report.outcomes[0],
            DeviceOutcome::NoNewData {
                device_id: "S1".to_string()
            }
        );
        assert!(matches!(report.outcomes[1], DeviceOutcome::Persisted { rows: 3, .. }));
        assert_eq!(report.skipped(), 1);
    }

    #[test]
    fn test_failures_are_isolated() {
        let mut readings = steady("S1", 0, 2);
        readings.extend(steady("S2", 0, 2));
        readings.extend(steady("S3", 0, 2));
        let frame = ReadingFrame::new(readings);

        let watermarks = InMemoryTableStore::new().failing_fetch("S1", FetchErrorKind::Transient);
        let sink = InMemoryTableStore::new().failing_write("S2", LoadErrorKind::SchemaMismatch);
        let mut processor = RhythmProcessor::new(watermarks, sink, settings());
        let report = processor.process_frame(&frame);

        assert_eq!(report.failed(), 2);
        assert_eq!(report.persisted(), 1);
        match &report.outcomes[0] {
            DeviceOutcome::Failed { device_id, error } => {
                assert_eq!(device_id, "S1");
                assert!(error.contains("watermark"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        match &report.outcomes[1] {
            DeviceOutcome::Failed { error, .. } => assert!(error.contains("sensors.hrv")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(report.outcomes[2].device_id(), "S3");
        assert_eq!(processor.sink().rows(&table()).len(), 2);
    }

    #[test]
    fn test_rerun_with_store_watermark_writes_nothing_new() {
        let frame = ReadingFrame::new(steady("S1", 0, 4));
        let mut first =
            RhythmProcessor::new(InMemoryTableStore::new(), InMemoryTableStore::new(), settings());
        first.process_frame(&frame);
        let store = first.sink().clone();

        let mut second = RhythmProcessor::new(store, InMemoryTableStore::new(), settings());
        let report = second.process_frame(&frame);
        assert_eq!(report.skipped(), 1);
        assert!(second.sink().rows(&table()).is_empty());
    }

    #[test]
    fn test_custom_config_reaches_stages() {
        let config = PipelineConfig {
            max_gap_seconds: 6.0,
            rmssd_window: 3,
            write_mode: WriteMode::Append,
        };
        let frame = ReadingFrame::new(vec![reading("S1", 0, 5000, 1)]);
        let series = annotate_device(frame, Watermark::MIN, &ctx(), &config).unwrap();

        assert_eq!(series.len(), 5);
        assert_eq!(series.synthetic_count(), 4);
        assert!(series.rows[2].hrv_rmssd.is_some());
    }

    #[test]
    fn test_report_serializes_with_status_tag() {
        let report = BatchReport {
            run_id: Uuid::nil(),
            outcomes: vec![DeviceOutcome::NoNewData {
                device_id: "S1".to_string(),
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"][0]["status"], "no_new_data");
        assert_eq!(json["outcomes"][0]["device_id"], "S1");
    }

    fn with_mode(write_mode: WriteMode) -> PipelineConfig {
        PipelineConfig {
            write_mode,
            ..PipelineConfig::default()
        }
    }

    fn two_devices() -> ReadingFrame {
        let mut readings = steady("S1", 0, 3);
        readings.extend(steady("S2", 0, 3));
        ReadingFrame::new(readings)
    }

    /// Sink already holding two rows for device S9
    fn populated_sink() -> InMemoryTableStore {
        let mut seed =
            RhythmProcessor::new(InMemoryTableStore::new(), InMemoryTableStore::new(), settings());
        seed.process_frame(&ReadingFrame::new(steady("S9", 0, 2)));
        seed.sink().clone()
    }

    fn devices_in(sink: &InMemoryTableStore) -> Vec<String> {
        sink.rows(&table()).iter().map(|r| r.device.clone()).collect()
    }

    #[test]
    fn test_truncate_clears_table_once_per_batch() {
        let mut processor = RhythmProcessor::with_config(
            InMemoryTableStore::new(),
            populated_sink(),
            settings(),
            with_mode(WriteMode::Truncate),
        );
        let report = processor.process_frame(&two_devices());

        assert_eq!(report.persisted(), 2);
        assert_eq!(
            devices_in(processor.sink()),
            vec!["S1", "S1", "S1", "S2", "S2", "S2"]
        );
    }

    #[test]
    fn test_write_empty_accepts_every_device_of_first_batch() {
        let mut processor = RhythmProcessor::with_config(
            InMemoryTableStore::new(),
            InMemoryTableStore::new(),
            settings(),
            with_mode(WriteMode::WriteEmpty),
        );
        let report = processor.process_frame(&two_devices());

        assert_eq!(report.persisted(), 2);
        assert_eq!(processor.sink().rows(&table()).len(), 6);
    }

    #[test]
    fn test_write_empty_on_populated_table_fails_every_device() {
        let mut processor = RhythmProcessor::with_config(
            InMemoryTableStore::new(),
            populated_sink(),
            settings(),
            with_mode(WriteMode::WriteEmpty),
        );
        let report = processor.process_frame(&two_devices());

        assert_eq!(report.failed(), 2);
        for outcome in &report.outcomes {
            match outcome {
                DeviceOutcome::Failed { error, .. } => assert!(error.contains("TableNotEmpty")),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(devices_in(processor.sink()), vec!["S9", "S9"]);
    }

    fn bucket_with(object: &str, contents: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("bucket")).unwrap();
        fs::write(dir.path().join("bucket").join(object), contents).unwrap();
        dir
    }

    fn memory_processor() -> RhythmProcessor<InMemoryTableStore, InMemoryTableStore> {
        RhythmProcessor::new(InMemoryTableStore::new(), InMemoryTableStore::new(), settings())
    }

    #[test]
    fn test_process_object_persists_every_device() {
        let dir = bucket_with("Rhythm_2024-03-01.csv", TWO_DEVICE_CSV);
        let source = CsvReadingSource::new(dir.path());
        let mut processor = memory_processor();

        let report = processor
            .process_object(&source, "bucket", "Rhythm_2024-03-01.csv")
            .unwrap()
            .unwrap();

        assert_eq!(report.persisted(), 2);
        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.device_id()).collect();
        assert_eq!(ids, vec!["S1", "S2"]);
        assert_eq!(devices_in(processor.sink()), vec!["S1", "S1", "S2"]);
    }

    #[test]
    fn test_process_object_skips_other_names() {
        let dir = bucket_with("Pulse.csv", TWO_DEVICE_CSV);
        let source = CsvReadingSource::new(dir.path());
        let mut processor = memory_processor();

        let report = processor.process_object(&source, "bucket", "Pulse.csv").unwrap();
        assert!(report.is_none());
        assert!(processor.sink().rows(&table()).is_empty());
    }

    #[test]
    fn test_process_object_missing_object() {
        let dir = bucket_with("Rhythm_present.csv", TWO_DEVICE_CSV);
        let source = CsvReadingSource::new(dir.path());
        let mut processor = memory_processor();

        let err = processor
            .process_object(&source, "bucket", "Rhythm_absent.csv")
            .unwrap_err();
        match err {
            PipelineError::Source(e) => assert_eq!(e.kind, SourceErrorKind::NotFound),
            other => panic!("expected a source error, got {other:?}"),
        }
    }
}

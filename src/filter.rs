//! Reading filters
//!
//! Two stages run back to back for every device:
//! - `TimeGapFilter` drops zero-signal rows and rows whose gap to the next
//!   event is too large to be a single missed beat
//! - `WatermarkFilter` keeps only rows newer than the last ingested timestamp
//!
//! The gap filter always runs first, so each row's gap is measured against its
//! natural chronological neighbour and never against a row the watermark
//! would have excluded.

use crate::context::StageContext;
use crate::error::{PipelineError, ValidationError};
use crate::types::{Column, ReadingFrame, SensorReading, Watermark};

/// Gaps at or above this many seconds are discarded rather than interpolated
pub const DEFAULT_MAX_GAP_SECONDS: f64 = 1.5;

/// Drops zero-heartbeat rows and implausible gaps
#[derive(Debug, Clone, Copy)]
pub struct TimeGapFilter {
    max_gap_seconds: f64,
}

impl Default for TimeGapFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeGapFilter {
    pub fn new() -> Self {
        Self::with_max_gap(DEFAULT_MAX_GAP_SECONDS)
    }

    /// Filter with a custom (exclusive) gap threshold in seconds
    pub fn with_max_gap(max_gap_seconds: f64) -> Self {
        Self { max_gap_seconds }
    }

    pub fn max_gap_seconds(&self) -> f64 {
        self.max_gap_seconds
    }

    /// Sort, recompute gaps, and drop rows that cannot be analysed.
    ///
    /// Fails if the frame lacks the heartbeat or timestamp columns, or holds
    /// rows for a device other than `ctx.device_id`.
    pub fn apply(
        &self,
        frame: ReadingFrame,
        ctx: &StageContext,
    ) -> Result<ReadingFrame, ValidationError> {
        frame.require(Column::Heartbeat)?;
        frame.require(Column::StartTimestamp)?;
        frame.require(Column::EndTimestamp)?;

        if let Some(stray) = frame
            .readings()
            .iter()
            .find(|r| r.device_id != ctx.device_id)
        {
            log::error!("{} frame contains rows for device {}", ctx, stray.device_id);
            return Err(ValidationError::MixedDevices {
                expected: ctx.device_id.clone(),
                found: stray.device_id.clone(),
            });
        }

        let (mut columns, mut readings) = frame.into_parts();
        let before = readings.len();
        log::info!("{} frame size before filtering: {} rows", ctx, before);

        // Stable: ties keep their upstream order
        readings.sort_by(|a, b| a.start_timestamp.cmp(&b.start_timestamp));

        let with_signal: Vec<SensorReading> = readings
            .into_iter()
            .map(|mut r| {
                r.time_gap_seconds = r.computed_gap();
                r
            })
            .filter(|r| r.heartbeat != 0)
            .collect();
        let zero_heartbeat = before - with_signal.len();

        let kept: Vec<SensorReading> = with_signal
            .into_iter()
            .filter(|r| self.gap_is_plausible(r.time_gap_seconds))
            .collect();

        log::info!(
            "{} frame size after filtering: {} rows ({} zero heartbeat, {} implausible gap)",
            ctx,
            kept.len(),
            zero_heartbeat,
            before - zero_heartbeat - kept.len()
        );

        if !columns.contains(&Column::TimeGapSeconds) {
            columns.push(Column::TimeGapSeconds);
        }
        Ok(ReadingFrame::with_columns(columns, kept))
    }

    fn gap_is_plausible(&self, gap: Option<f64>) -> bool {
        matches!(gap, Some(g) if g >= 0.0 && g < self.max_gap_seconds)
    }
}

/// Keeps rows strictly newer than a device's watermark
pub struct WatermarkFilter;

impl WatermarkFilter {
    /// Returns `PipelineError::NoNewData` when nothing survives. Callers treat
    /// that as "skip this device", not as a failure.
    pub fn apply(
        frame: ReadingFrame,
        watermark: Watermark,
        ctx: &StageContext,
    ) -> Result<ReadingFrame, PipelineError> {
        let (columns, readings) = frame.into_parts();
        let before = readings.len();

        let delta: Vec<SensorReading> = readings
            .into_iter()
            .filter(|r| {
                r.start_timestamp
                    .as_ref()
                    .is_some_and(|start| watermark.admits(start))
            })
            .collect();

        if delta.is_empty() {
            log::info!("{} no new data after watermark {}", ctx, watermark);
            return Err(PipelineError::NoNewData {
                device_id: ctx.device_id.clone(),
            });
        }

        log::debug!(
            "{} watermark {} kept {} of {} rows",
            ctx,
            watermark,
            delta.len(),
            before
        );
        Ok(ReadingFrame::with_columns(columns, delta))
    }
}

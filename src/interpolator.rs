//! Gap interpolation
//!
//! Reconstructs the implied one-sample-per-second cadence inside each
//! reading's own window. A reading whose gap exceeds one second is preceded by
//! synthetic copies advanced by whole seconds, giving the rolling statistic a
//! dense series to work on.

use chrono::Duration;

use crate::context::StageContext;
use crate::types::{ReadingFrame, SensorReading};

/// Expands readings into evenly spaced one-second samples
pub struct GapInterpolator;

impl GapInterpolator {
    /// Expand every reading in order. Never fails; readings with a gap of at
    /// most one second (or no computable gap) pass through unchanged.
    pub fn interpolate(frame: ReadingFrame, ctx: &StageContext) -> ReadingFrame {
        let (columns, readings) = frame.into_parts();
        let original = readings.len();

        let expanded: Vec<SensorReading> = readings.into_iter().flat_map(expand).collect();

        log::info!(
            "{} interpolated missing data: {} rows ({} synthetic)",
            ctx,
            expanded.len(),
            expanded.len() - original
        );
        ReadingFrame::with_columns(columns, expanded)
    }
}

/// Upper bound on up-front allocation per expanded reading
const MAX_PREALLOCATED: usize = 64;

/// Number of whole seconds missing inside a gap
fn missing_samples(gap_seconds: f64) -> i64 {
    if gap_seconds > 1.0 {
        gap_seconds.floor() as i64 - 1
    } else {
        0
    }
}

/// Synthetic rows for `reading` in increasing offset order, then `reading`.
fn expand(reading: SensorReading) -> Vec<SensorReading> {
    let (Some(start), Some(gap)) = (reading.start_timestamp, reading.computed_gap()) else {
        return vec![reading];
    };

    let missing = missing_samples(gap);
    let mut rows = Vec::with_capacity((missing.max(0) as usize).min(MAX_PREALLOCATED) + 1);
    for offset in 1..=missing {
        let Some(shifted) = start.checked_add_signed(Duration::seconds(offset)) else {
            break;
        };
        rows.push(SensorReading {
            start_timestamp: Some(shifted),
            synthetic: true,
            ..reading.clone()
        });
    }
    rows.push(reading);
    rows
}

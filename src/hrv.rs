//! RR intervals and rolling RMSSD
//!
//! Each row's RR interval is the distance to the next observed event in
//! milliseconds. RMSSD is computed over a fixed sliding window of the most
//! recent RR values and attached to the row closing the window.

use std::collections::VecDeque;

use crate::context::StageContext;
use crate::error::ValidationError;
use crate::timestamp::parse_timestamp;
use crate::types::{AnnotatedReading, AnnotatedSeries, Column, ReadingFrame, SensorReading};

/// Default number of RR intervals per RMSSD window
pub const DEFAULT_RMSSD_WINDOW: usize = 10;

/// Attaches RR interval and rolling RMSSD to every row
#[derive(Debug, Clone, Copy)]
pub struct HrvAnnotator {
    window: usize,
}

impl Default for HrvAnnotator {
    fn default() -> Self {
        Self::new()
    }
}

impl HrvAnnotator {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_RMSSD_WINDOW)
    }

    /// Annotator with a custom window size. Windows shorter than two values
    /// have no successive differences and never produce a value.
    pub fn with_window(window: usize) -> Self {
        Self { window }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Annotate an interpolated frame.
    ///
    /// Unparseable timestamps become `None` and are reported once as a
    /// warning; only a frame without the start/end timestamp columns fails.
    pub fn annotate(
        &self,
        frame: ReadingFrame,
        ctx: &StageContext,
    ) -> Result<AnnotatedSeries, ValidationError> {
        frame.require(Column::StartTimestamp)?;
        frame.require(Column::EndTimestamp)?;

        log::info!("{} started HRV calculation", ctx);
        let (_, readings) = frame.into_parts();

        let mut window = RmssdWindow::new(self.window);
        let mut missing_timestamps = 0usize;
        let mut rows = Vec::with_capacity(readings.len());

        for reading in readings {
            let timestamp = parse_timestamp(&reading.timestamp_str);
            let next_timestamp = parse_timestamp(&reading.next_timestamp_str);
            if reading.start_timestamp.is_none()
                || reading.end_timestamp.is_none()
                || timestamp.is_none()
                || next_timestamp.is_none()
            {
                missing_timestamps += 1;
            }

            let rr_interval_ms = rr_interval_ms(&reading);
            let hrv_rmssd = window.push(rr_interval_ms);

            rows.push(AnnotatedReading {
                reading,
                timestamp,
                next_timestamp,
                rr_interval_ms,
                hrv_rmssd,
            });
        }

        if missing_timestamps > 0 {
            log::warn!(
                "{} {} rows have invalid or missing timestamps; treated as missing values",
                ctx,
                missing_timestamps
            );
        }
        log::info!("{} HRV calculation completed over {} rows", ctx, rows.len());

        Ok(AnnotatedSeries {
            device_id: ctx.device_id.clone(),
            rows,
        })
    }
}

/// `(end - start)` in milliseconds, or `None` if either instant is missing
pub fn rr_interval_ms(reading: &SensorReading) -> Option<f64> {
    match (&reading.start_timestamp, &reading.end_timestamp) {
        (Some(start), Some(end)) => (*end - *start)
            .num_microseconds()
            .map(|micros| micros as f64 / 1000.0),
        _ => None,
    }
}

/// Root mean square of successive differences.
///
/// Differences touching a missing value are skipped; returns `None` when no
/// difference remains.
pub fn rmssd(values: &[Option<f64>]) -> Option<f64> {
    let (sum_sq, count) = values
        .windows(2)
        .filter_map(|pair| match (pair[0], pair[1]) {
            (Some(a), Some(b)) => Some(b - a),
            _ => None,
        })
        .fold((0.0, 0usize), |(sum, n), diff| (sum + diff * diff, n + 1));

    if count == 0 {
        None
    } else {
        Some((sum_sq / count as f64).sqrt())
    }
}

/// Upper bound on up-front window allocation; larger windows grow on demand
const MAX_PREALLOCATED: usize = 64;

/// Fixed-size queue of the most recent RR values
#[derive(Debug, Clone)]
pub struct RmssdWindow {
    values: VecDeque<Option<f64>>,
    size: usize,
}

impl RmssdWindow {
    pub fn new(size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(size.min(MAX_PREALLOCATED)),
            size,
        }
    }

    /// Push the next value; returns RMSSD once the window is full.
    pub fn push(&mut self, value: Option<f64>) -> Option<f64> {
        self.values.push_back(value);
        while self.values.len() > self.size {
            self.values.pop_front();
        }
        if self.size == 0 || self.values.len() < self.size {
            return None;
        }
        rmssd(self.values.make_contiguous())
    }
}

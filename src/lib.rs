//! Rhythm HRV - gap-filled heartbeat time series with rolling RMSSD
//!
//! Rhythm turns irregular heartbeat-sensor event readings into a regular,
//! gap-filled series annotated with heart-rate variability, through a
//! deterministic per-device pipeline: gap filtering → watermark filtering →
//! gap interpolation → RR interval and rolling RMSSD annotation.
//!
//! ## Modules
//!
//! - **Stages**: `filter`, `interpolator`, `hrv` - pure functions of
//!   `(frame, context)`
//! - **Pipeline**: per-device composition and batch orchestration
//! - **Adapters**: raw-reading source, watermark source and persistence sink

pub mod adapters;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod hrv;
pub mod interpolator;
pub mod pipeline;
pub mod timestamp;
pub mod types;

pub use adapters::{
    CsvReadingSource, InMemoryTableStore, NdjsonTableStore, PersistenceSink, ReadingSource,
    TableRef, WatermarkSource, WriteMode,
};
pub use config::{PipelineConfig, Settings};
pub use context::StageContext;
pub use error::{FetchError, LoadError, PipelineError, SourceError, ValidationError};
pub use filter::{TimeGapFilter, WatermarkFilter};
pub use hrv::HrvAnnotator;
pub use interpolator::GapInterpolator;
pub use pipeline::{annotate_device, BatchReport, DeviceOutcome, RhythmProcessor};
pub use types::{AnnotatedReading, AnnotatedSeries, ReadingFrame, SensorReading, Watermark};

/// Rhythm version
pub const RHYTHM_VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for Rhythm HRV
//!
//! Each external collaborator gets one error struct carrying a small kind
//! enumeration, so callers can branch on what went wrong without depending on
//! any storage or transport library.

use serde::Serialize;
use thiserror::Error;

use crate::types::Column;

/// Structural problems with a reading frame. Fatal for the current device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required column: {0}")]
    MissingColumn(Column),

    #[error("Frame for device {expected} contains a row for device {found}")]
    MixedDevices { expected: String, found: String },
}

/// Why a watermark lookup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    NotFound,
    Forbidden,
    MalformedQuery,
    Transient,
    Unexpected,
}

/// Watermark lookup failure, surfaced with device context
#[derive(Debug, Clone, Error)]
#[error("Failed to fetch watermark for device {device_id} ({kind:?}): {message}")]
pub struct FetchError {
    pub device_id: String,
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(device_id: &str, kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            device_id: device_id.to_string(),
            kind,
            message: message.into(),
        }
    }
}

/// Why a persistence write failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorKind {
    EmptyInput,
    MissingTarget,
    NotFound,
    SchemaMismatch,
    Forbidden,
    TableNotEmpty,
    Transient,
    Unexpected,
}

/// Persistence failure, surfaced with dataset/table context
#[derive(Debug, Clone, Error)]
#[error("Failed to load data into {dataset}.{table} ({kind:?}): {message}")]
pub struct LoadError {
    pub dataset: String,
    pub table: String,
    pub kind: LoadErrorKind,
    pub message: String,
}

impl LoadError {
    pub fn new(
        dataset: &str,
        table: &str,
        kind: LoadErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            dataset: dataset.to_string(),
            table: table.to_string(),
            kind,
            message: message.into(),
        }
    }
}

/// Why a raw-reading object could not be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    NotFound,
    Forbidden,
    InvalidName,
    Parse,
    Transient,
}

/// Raw-reading source failure
#[derive(Debug, Clone, Error)]
#[error("Failed to process object {object} ({kind:?}): {message}")]
pub struct SourceError {
    pub object: String,
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(object: &str, kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            object: object.to_string(),
            kind,
            message: message.into(),
        }
    }
}

/// Missing or unusable runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is not set")]
    MissingVar(String),

    #[error("Environment variable {0} is empty")]
    EmptyVar(String),

    #[error("Invalid {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Errors that can occur while processing a device's readings
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Control signal rather than a failure: nothing newer than the watermark.
    #[error("No new data for device {device_id}")]
    NoNewData { device_id: String },

    #[error(transparent)]
    UpstreamFetch(#[from] FetchError),

    #[error(transparent)]
    Persistence(#[from] LoadError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    pub fn is_no_new_data(&self) -> bool {
        matches!(self, PipelineError::NoNewData { .. })
    }
}

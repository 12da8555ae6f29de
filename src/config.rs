//! Runtime configuration
//!
//! Target table ids come from the environment; pipeline tuning has defaults
//! matching the stage constants and can be overridden by the caller.

use serde::{Deserialize, Serialize};
use std::env;

use crate::adapters::{TableRef, WriteMode};
use crate::error::ConfigError;
use crate::filter::DEFAULT_MAX_GAP_SECONDS;
use crate::hrv::DEFAULT_RMSSD_WINDOW;

/// Environment variable naming the target dataset
pub const ENV_DATASET_ID: &str = "DATASET_ID";

/// Environment variable naming the target table
pub const ENV_TABLE_ID: &str = "TABLE_ID";

/// Where annotated series are read from and written to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub dataset_id: String,
    pub table_id: String,
}

impl Settings {
    pub fn new(dataset_id: impl Into<String>, table_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }

    /// Read `DATASET_ID` and `TABLE_ID`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| -> Result<String, ConfigError> {
            let value = lookup(key).ok_or_else(|| ConfigError::MissingVar(key.to_string()))?;
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyVar(key.to_string()));
            }
            Ok(value.trim().to_string())
        };

        Ok(Self {
            dataset_id: read(ENV_DATASET_ID)?,
            table_id: read(ENV_TABLE_ID)?,
        })
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.dataset_id, &self.table_id)
    }
}

/// Stage tuning and write behaviour
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Exclusive upper bound on a plausible gap (seconds)
    pub max_gap_seconds: f64,
    /// RR values per RMSSD window
    pub rmssd_window: usize,
    pub write_mode: WriteMode,
}

impl PipelineConfig {
    /// Reject tuning the stages cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.max_gap_seconds.is_finite() || self.max_gap_seconds <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "max_gap_seconds",
                reason: format!("{} is not a positive number of seconds", self.max_gap_seconds),
            });
        }
        if self.rmssd_window < 2 {
            return Err(ConfigError::InvalidValue {
                name: "rmssd_window",
                reason: format!("{} is smaller than 2 RR values", self.rmssd_window),
            });
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_gap_seconds: DEFAULT_MAX_GAP_SECONDS,
            rmssd_window: DEFAULT_RMSSD_WINDOW,
            write_mode: WriteMode::Append,
        }
    }
}

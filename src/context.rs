//! Per-device stage context
//!
//! Stages are pure functions of `(data, context)`. The context carries the
//! correlation ids that every diagnostic line is tagged with, so no stage
//! needs a module-level logger of its own.

use std::fmt;
use uuid::Uuid;

/// Correlation ids for one device within one batch run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    /// Batch run this device belongs to
    pub run_id: Uuid,
    /// Device whose readings are being processed
    pub device_id: String,
}

impl StageContext {
    /// Context with a fresh run id
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::for_run(Uuid::new_v4(), device_id)
    }

    /// Context for a device inside an existing run
    pub fn for_run(run_id: Uuid, device_id: impl Into<String>) -> Self {
        Self {
            run_id,
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[run={} device={}]", self.run_id, self.device_id)
    }
}

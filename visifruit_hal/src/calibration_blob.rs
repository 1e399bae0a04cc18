//! Per-actuator calibration blob persistence (§6 "Actuator config
//! files (persisted)"). An opaque, versioned key-value record written
//! after a `calibrate()` pass and read back before `init()`, the same
//! shape the original Python drivers wrote as
//! `calibration_<actuator>.json` — `success`, pulse-width bounds,
//! optimal frequency, response time, accuracy, and a free-form notes
//! field.
//!
//! The core never touches a filesystem path (§1, §6); this module, and
//! the decision of where blobs live on disk, belongs to whatever wires
//! the core up.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// On-disk format version. Bumped only if the record shape changes in
/// a way old readers can't tolerate.
pub const BLOB_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CalibrationBlobError {
    #[error("reading {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("parsing {path}: {source}")]
    Parse { path: String, source: serde_json::Error },

    #[error("blob at {path} has version {found}, expected {expected}")]
    VersionMismatch { path: String, found: u32, expected: u32 },
}

/// An opaque per-actuator calibration record. Fields beyond `version`
/// are free-form so each driver variant (solenoid/servo/stepper) can
/// store whatever its `calibrate()` pass measured without a shared
/// schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBlob {
    pub version: u32,
    pub success: bool,
    pub calibration_date: String,
    pub notes: String,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

impl CalibrationBlob {
    pub fn new(success: bool, calibration_date: impl Into<String>) -> Self {
        Self {
            version: BLOB_VERSION,
            success,
            calibration_date: calibration_date.into(),
            notes: String::new(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    /// Reads and validates a blob from `path`. Returns `Ok(None)` if
    /// the file simply doesn't exist yet — a driver's first boot
    /// before any `calibrate()` pass has run.
    pub fn load(path: &Path) -> Result<Option<Self>, CalibrationBlobError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CalibrationBlobError::Io { path: path.display().to_string(), source });
            }
        };
        let blob: CalibrationBlob = serde_json::from_str(&raw)
            .map_err(|source| CalibrationBlobError::Parse { path: path.display().to_string(), source })?;
        if blob.version != BLOB_VERSION {
            return Err(CalibrationBlobError::VersionMismatch {
                path: path.display().to_string(),
                found: blob.version,
                expected: BLOB_VERSION,
            });
        }
        Ok(Some(blob))
    }

    /// Writes the blob, pretty-printed, overwriting any prior record
    /// at `path`.
    pub fn save(&self, path: &Path) -> Result<(), CalibrationBlobError> {
        let raw = serde_json::to_string_pretty(self)
            .expect("CalibrationBlob serialization is infallible");
        std::fs::write(path, raw)
            .map_err(|source| CalibrationBlobError::Io { path: path.display().to_string(), source })
    }
}

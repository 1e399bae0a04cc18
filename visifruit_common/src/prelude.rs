//! Convenient re-exports: `use visifruit_common::prelude::*;`

pub use crate::calibration::{Calibration, DedupConfig, DiverterOffsets};
pub use crate::error::{BusyReason, ConfigError, CoreError};
pub use crate::hal::{ActuatorHal, CancelToken, Edge, HalError, Level, PinId, PinMode};
pub use crate::types::{
    ActivationCommand, ActuatorHealth, ActuatorTarget, BBoxPx, BeltState, Cluster, Direction,
    FruitClass, FruitPosition, RawDetection,
};

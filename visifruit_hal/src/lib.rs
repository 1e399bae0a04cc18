//! VisiFruit HAL
//!
//! The three concrete [`visifruit_common::hal::ActuatorHal`] backends
//! (§4.A) plus the [`DriverRegistry`] that selects between them by
//! runtime probe, registered as factories rather than a global
//! singleton (§9 design note: no process-wide HAL state).
//!
//! # Module Structure
//!
//! - [`drivers`] - simulation, Pi-5, and legacy-Pi backends
//! - [`registry`] - `DriverRegistry`, probe-based backend selection
//! - [`calibration_blob`] - per-actuator calibration persistence (§6)

pub mod calibration_blob;
pub mod drivers;
pub mod registry;

pub use registry::{DriverRegistry, RegistryError};

use std::path::Path;

/// Probes the host for the most capable real backend, falling back to
/// `"simulation"` when no GPIO interface is present — the runtime
/// binary's default, unconditional-success path (§4.A: "Selection is
/// by runtime probe").
pub fn probe_backend_name() -> &'static str {
    if Path::new("/dev/gpiochip0").exists() {
        "pi5"
    } else if Path::new("/dev/gpiomem").exists() {
        "legacy-pi"
    } else {
        "simulation"
    }
}

/// A [`DriverRegistry`] pre-populated with all three backends.
pub fn default_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry::register_all_drivers(&mut registry);
    registry
}

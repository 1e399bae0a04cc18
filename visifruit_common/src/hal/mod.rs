//! Hardware abstraction layer primitives shared between the core and
//! `visifruit_hal`'s concrete driver backends.

pub mod driver;
pub mod types;

pub use driver::{ActuatorHal, HalError, PulseTrainHandle};
pub use types::{CancelToken, Debounce, Edge, EdgeEvent, Level, PinId, PinMode, Pull};

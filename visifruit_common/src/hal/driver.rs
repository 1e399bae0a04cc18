//! The Actuator HAL trait (§4.A): a thin, testable abstraction over
//! digital GPIO, soft-PWM, and step-pulse trains, satisfied bit-exactly
//! by three implementations (simulation, Pi-5, legacy Pi) in
//! `visifruit_hal`.

use std::sync::mpsc::Receiver;
use std::time::Duration;
use thiserror::Error;

use super::types::{CancelToken, Edge, EdgeEvent, Level, PinId, PinMode};

/// HAL-level failures (§4.A "Fails with").
#[derive(Debug, Clone, Error)]
pub enum HalError {
    #[error("pin {0:?} already claimed")]
    PinBusy(PinId),

    #[error("pin {0:?} does not support hardware edge detection, falling back to polling")]
    EdgeUnsupported(PinId),

    #[error("{field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("hardware fault on pin {pin:?}: {reason}")]
    HardwareFault { pin: PinId, reason: String },
}

/// Handle to an in-progress pulse train running on its dedicated OS
/// thread. Joining returns the number of pulses actually emitted,
/// which is short of `pulses` iff the cancel token fired first.
pub struct PulseTrainHandle {
    join: std::thread::JoinHandle<u32>,
}

impl PulseTrainHandle {
    pub fn new(join: std::thread::JoinHandle<u32>) -> Self {
        Self { join }
    }

    pub fn join(self) -> u32 {
        self.join.join().unwrap_or(0)
    }
}

/// Hardware abstraction satisfied bit-exactly by all three backends;
/// only the blocking behavior on real voltage differs (§4.A).
pub trait ActuatorHal: Send + Sync {
    /// Backend name, e.g. `"simulation"`, `"pi5"`, `"legacy-pi"`.
    fn name(&self) -> &'static str;

    fn set_pin_mode(&self, pin: PinId, mode: PinMode) -> Result<(), HalError>;

    fn write(&self, pin: PinId, level: Level) -> Result<(), HalError>;

    fn read(&self, pin: PinId) -> Result<Level, HalError>;

    fn pwm_start(&self, pin: PinId, freq_hz: f64, duty: f64) -> Result<(), HalError>;

    fn pwm_set_duty(&self, pin: PinId, duty: f64) -> Result<(), HalError>;

    fn pwm_stop(&self, pin: PinId) -> Result<(), HalError>;

    /// Runs a step-pulse train on a dedicated OS thread; the returned
    /// handle is joined by the caller to learn how many pulses were
    /// actually emitted (§4.A, §5 "blocking sleeps move to a dedicated
    /// OS thread with a cancellation token").
    fn pulse_train(
        &self,
        pin: PinId,
        pulses: u32,
        period_us: u32,
        pulse_width_us: u32,
        cancel: CancelToken,
    ) -> Result<PulseTrainHandle, HalError>;

    /// Subscribes to edge transitions on `pin`. Returns a bounded
    /// channel receiver the caller polls or bridges into its own task
    /// channel — the HAL side is the thinnest possible shim that only
    /// enqueues (§9 design note), never an arbitrary callback closure.
    /// Falls back to a polling loop on a dedicated thread, with the
    /// same contract, when hardware-assisted edge detection is
    /// unavailable.
    fn on_edge(
        &self,
        pin: PinId,
        edge: Edge,
        debounce: Duration,
        cancel: CancelToken,
    ) -> Result<Receiver<EdgeEvent>, HalError>;
}

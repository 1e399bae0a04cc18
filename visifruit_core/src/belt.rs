//! The Belt Controller (§4.D): direction + on/off + a self-arming
//! safety timer, behind one interface regardless of motor topology.
//! The internal timer uses a generation counter so a stale timer
//! can never auto-stop a belt that has since been re-armed, the same
//! guard a cycle-counted safety timeout needs against a counter that
//! wrapped or reset mid-flight — here expressed as a real tokio timer
//! since the belt has no fixed cycle of its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use visifruit_common::error::CoreError;
use visifruit_common::hal::driver::ActuatorHal;
use visifruit_common::hal::types::{Level, PinMode};
use visifruit_common::types::{BeltState, Direction};

use crate::config::{BeltConfig, BeltVariant};

/// Belt-specific rejection that doesn't fit the shared [`CoreError`]
/// taxonomy (§4.D: "`set_speed` ... no-op for on/off variants; returns
/// Unsupported").
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BeltError {
    #[error("belt variant {0:?} does not support speed control")]
    Unsupported(BeltVariant),
    #[error(transparent)]
    Core(#[from] CoreError),
}

pub struct BeltController {
    hal: Arc<dyn ActuatorHal>,
    config: BeltConfig,
    state: Mutex<BeltState>,
    safety_timeout: Mutex<Duration>,
    /// Bumped on every start/re-arm; a pending timer task checks this
    /// before acting so a stale timer never stops a belt that was
    /// re-armed or already stopped.
    generation: Arc<AtomicU64>,
}

impl BeltController {
    pub fn new(hal: Arc<dyn ActuatorHal>, config: BeltConfig, default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            hal,
            config,
            state: Mutex::new(BeltState::Idle),
            safety_timeout: Mutex::new(default_timeout),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn snapshot(&self) -> BeltState {
        self.state.lock().clone()
    }

    pub fn init(&self) -> Result<(), CoreError> {
        for pin in [Some(self.config.forward_pin), Some(self.config.reverse_pin), self.config.enable_pin]
            .into_iter()
            .flatten()
        {
            self.hal
                .set_pin_mode(pin, PinMode::Output { initial: Level::Low })
                .map_err(|e| fault(pin.0, e))?;
        }
        Ok(())
    }

    fn set_lines(&self, direction: Option<Direction>, duty: f64) -> Result<(), CoreError> {
        match self.config.variant {
            BeltVariant::RelayHBridge => {
                let (fwd, rev) = match direction {
                    Some(Direction::Forward) => (Level::High, Level::Low),
                    Some(Direction::Reverse) => (Level::Low, Level::High),
                    None => (Level::Low, Level::Low),
                };
                self.hal.write(self.config.forward_pin, fwd).map_err(|e| fault(self.config.forward_pin.0, e))?;
                self.hal.write(self.config.reverse_pin, rev).map_err(|e| fault(self.config.reverse_pin.0, e))?;
            }
            BeltVariant::PwmHBridge => {
                let (fwd, rev) = match direction {
                    Some(Direction::Forward) => (Level::High, Level::Low),
                    Some(Direction::Reverse) => (Level::Low, Level::High),
                    None => (Level::Low, Level::Low),
                };
                self.hal.write(self.config.forward_pin, fwd).map_err(|e| fault(self.config.forward_pin.0, e))?;
                self.hal.write(self.config.reverse_pin, rev).map_err(|e| fault(self.config.reverse_pin.0, e))?;
                if direction.is_some() {
                    self.hal
                        .pwm_start(self.config.forward_pin, self.config.pwm_freq_hz, duty)
                        .map_err(|e| fault(self.config.forward_pin.0, e))?;
                } else {
                    let _ = self.hal.pwm_stop(self.config.forward_pin);
                }
            }
            BeltVariant::StepPulsed => {
                // Direction line only; speed is step rate, driven by a
                // pulse_train the caller owns elsewhere in the pipeline
                // prototypes — out of scope for the production belt.
                let line = match direction {
                    Some(Direction::Forward) => Level::High,
                    Some(Direction::Reverse) => Level::Low,
                    None => Level::Low,
                };
                self.hal.write(self.config.forward_pin, line).map_err(|e| fault(self.config.forward_pin.0, e))?;
            }
        }
        if let Some(enable_pin) = self.config.enable_pin {
            let level = if direction.is_some() { Level::High } else { Level::Low };
            self.hal.write(enable_pin, level).map_err(|e| fault(enable_pin.0, e))?;
        }
        Ok(())
    }

    /// Starts the belt, passing through `Stop` with the configured
    /// quiescence delay whenever the direction is changing (§4.D: "not
    /// negotiable by callers"). Arms the safety timer.
    pub async fn start(self: &Arc<Self>, direction: Direction, speed_fraction: f64) -> Result<(), CoreError> {
        let previous_direction = match &*self.state.lock() {
            BeltState::Running(d) => Some(*d),
            _ => None,
        };
        *self.state.lock() = BeltState::Starting;

        if previous_direction.is_some() && previous_direction != Some(direction) {
            self.set_lines(None, 0.0)?;
            tokio::time::sleep(self.config.quiescence()).await;
        }

        if let Err(e) = self.set_lines(Some(direction), speed_fraction.clamp(0.0, 1.0)) {
            *self.state.lock() = BeltState::Error(e.to_string());
            return Err(e);
        }
        *self.state.lock() = BeltState::Running(direction);
        self.arm_safety_timer();
        Ok(())
    }

    fn arm_safety_timer(self: &Arc<Self>) {
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let timeout = *self.safety_timeout.lock();
        if timeout <= Duration::ZERO {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if this.generation.load(Ordering::SeqCst) != my_generation {
                return; // re-armed, stopped, or superseded since.
            }
            warn!("belt safety timeout expired, auto-stopping");
            let _ = this.stop().await;
        });
    }

    /// Re-arms the safety timer with a new timeout; zero or negative
    /// disables auto-stop (§4.D).
    pub fn set_safety_timeout(self: &Arc<Self>, timeout: Duration) {
        *self.safety_timeout.lock() = timeout;
        if matches!(*self.state.lock(), BeltState::Running(_)) {
            self.arm_safety_timer();
        }
    }

    pub async fn stop(self: &Arc<Self>) -> Result<(), CoreError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = BeltState::Stopping;
        self.set_lines(None, 0.0)?;
        *self.state.lock() = BeltState::Idle;
        Ok(())
    }

    /// Unsupported for on/off motor topologies (§4.D).
    pub fn set_speed(&self, fraction: f64) -> Result<(), BeltError> {
        if self.config.variant != BeltVariant::PwmHBridge {
            return Err(BeltError::Unsupported(self.config.variant));
        }
        if let BeltState::Running(direction) = *self.state.lock() {
            self.set_lines(Some(direction), fraction.clamp(0.0, 1.0))?;
        }
        Ok(())
    }

    /// Idempotent: forces the release path and latches `Emergency`.
    pub fn emergency_stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.set_lines(None, 0.0);
        let mut state = self.state.lock();
        if !matches!(*state, BeltState::Emergency) {
            info!("belt emergency stop engaged");
        }
        *state = BeltState::Emergency;
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        if matches!(*state, BeltState::Emergency | BeltState::Error(_)) {
            *state = BeltState::Idle;
        }
    }
}

fn fault(pin: u32, e: visifruit_common::hal::driver::HalError) -> CoreError {
    CoreError::HardwareFault {
        pin_or_actuator: format!("gpio{pin}"),
        reason: e.to_string(),
        persistent: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visifruit_hal::drivers::simulation::SimulationHal;

    fn belt(timeout: Duration) -> Arc<BeltController> {
        let hal: Arc<dyn ActuatorHal> = Arc::new(SimulationHal::new());
        let cfg = crate::config::test_support::sample_machine_config().belt;
        BeltController::new(hal, cfg, timeout)
    }

    #[tokio::test]
    async fn start_transitions_to_running() {
        let b = belt(Duration::from_secs(5));
        b.init().unwrap();
        b.start(Direction::Forward, 1.0).await.unwrap();
        assert_eq!(b.snapshot(), BeltState::Running(Direction::Forward));
    }

    #[tokio::test]
    async fn stop_returns_to_idle() {
        let b = belt(Duration::from_secs(5));
        b.init().unwrap();
        b.start(Direction::Forward, 1.0).await.unwrap();
        b.stop().await.unwrap();
        assert_eq!(b.snapshot(), BeltState::Idle);
    }

    #[tokio::test]
    async fn safety_timeout_auto_stops() {
        let b = belt(Duration::from_millis(20));
        b.init().unwrap();
        b.start(Direction::Forward, 1.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(b.snapshot(), BeltState::Idle);
    }

    #[tokio::test]
    async fn relay_variant_rejects_set_speed() {
        let b = belt(Duration::from_secs(5));
        b.init().unwrap();
        b.start(Direction::Forward, 1.0).await.unwrap();
        assert!(matches!(b.set_speed(0.5), Err(BeltError::Unsupported(_))));
    }

    #[tokio::test]
    async fn emergency_stop_is_idempotent_and_latches() {
        let b = belt(Duration::from_secs(5));
        b.init().unwrap();
        b.start(Direction::Forward, 1.0).await.unwrap();
        b.emergency_stop();
        b.emergency_stop();
        assert_eq!(b.snapshot(), BeltState::Emergency);
        b.reset();
        assert_eq!(b.snapshot(), BeltState::Idle);
    }
}

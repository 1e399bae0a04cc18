//! The Labeler Driver (§4.B): one actuator, three variants behind one
//! trait, rate-limited and latchable. The state machine mirrors the
//! teacher's `SafeStopExecutor` (`safety::stop`): a small enum driven
//! by explicit, idempotent transitions, with `Emergency` latched until
//! an explicit reset regardless of how many times it is requested.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use visifruit_common::error::{BusyReason, CoreError};
use visifruit_common::hal::driver::ActuatorHal;
use visifruit_common::hal::types::{CancelToken, Level, PinMode};
use visifruit_common::types::ActuatorHealth;

use crate::config::{LabelerConfig, LabelerVariant};

/// Driver lifecycle (§4.B "State machine per driver"). `Calibrating`
/// and `Active` both return to `Idle` on success; any failure during
/// either routes through the forced release path and, for repeated or
/// persistent faults, to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelerState {
    Offline,
    Initializing,
    Idle,
    Active,
    Calibrating,
    Error,
    Emergency,
}

fn duty_for_angle(angle_deg: f64, rest_deg: f64, activation_deg: f64) -> f64 {
    // Standard hobby-servo PWM convention: 1ms..2ms pulse at 50Hz maps
    // to duty 0.05..0.10 across the servo's travel.
    let span = (activation_deg - rest_deg).abs().max(1.0);
    let frac = ((angle_deg - rest_deg) / span).clamp(0.0, 1.0);
    0.05 + frac * 0.05
}

/// Owns the labeler's actuator handle, health, and rate limiter. One
/// instance per process; never cloned (the HAL pin is exclusively
/// owned, §5).
pub struct LabelerDriver {
    hal: Arc<dyn ActuatorHal>,
    config: LabelerConfig,
    state: Mutex<LabelerState>,
    health: Mutex<ActuatorHealth>,
    recent_activations: Mutex<VecDeque<Instant>>,
    emergency_notify: Notify,
}

impl LabelerDriver {
    pub fn new(hal: Arc<dyn ActuatorHal>, config: LabelerConfig) -> Self {
        Self {
            hal,
            config,
            state: Mutex::new(LabelerState::Offline),
            health: Mutex::new(ActuatorHealth::default()),
            recent_activations: Mutex::new(VecDeque::new()),
            emergency_notify: Notify::new(),
        }
    }

    pub fn state(&self) -> LabelerState {
        *self.state.lock()
    }

    pub fn health(&self) -> ActuatorHealth {
        *self.health.lock()
    }

    pub fn record_missed_deadline(&self) {
        self.health.lock().record_missed_deadline();
    }

    /// Self-test pulse, then `Idle`. No calibration blob persistence
    /// lives here — `visifruit_hal::calibration_blob` owns the
    /// filesystem path and the wrapper binary decides when to read and
    /// write it, around `init()`/`calibrate()` (§6: "the core never
    /// edits these outside the `calibrate()` path").
    pub async fn init(&self) -> Result<(), CoreError> {
        *self.state.lock() = LabelerState::Initializing;
        self.hal
            .set_pin_mode(self.config.pin, PinMode::Output { initial: Level::Low })
            .map_err(|e| hardware_fault(self.config.pin.0, e, false))?;
        if let Some(enable_pin) = self.config.enable_pin {
            self.hal
                .set_pin_mode(enable_pin, PinMode::Output { initial: Level::Low })
                .map_err(|e| hardware_fault(enable_pin.0, e, false))?;
        }
        self.self_test_pulse().await?;
        *self.state.lock() = LabelerState::Idle;
        info!(pin = self.config.pin.0, "labeler initialized");
        Ok(())
    }

    async fn self_test_pulse(&self) -> Result<(), CoreError> {
        self.drive_variant(Duration::from_millis(20), 0.1).await
    }

    /// Rejects per §4.B: `Emergency`, already `Active`, rate-limited,
    /// or `duration > max_activation_time`. On accept, transitions
    /// Idle→Active, drives the actuator, then returns to Idle — or, on
    /// failure, runs the forced release path and records the error.
    pub async fn activate_for(
        &self,
        duration: Duration,
        intensity: f64,
        max_per_minute: u32,
        max_activation_s: f64,
        now: Instant,
    ) -> Result<(), CoreError> {
        {
            let state = *self.state.lock();
            if state == LabelerState::Emergency {
                return Err(CoreError::EmergencyLatched { actuator: "labeler".into() });
            }
            if state == LabelerState::Active {
                return Err(CoreError::Busy {
                    actuator: "labeler".into(),
                    reason: BusyReason::AlreadyActive,
                });
            }
        }
        if duration.as_secs_f64() > max_activation_s {
            return Err(CoreError::Busy {
                actuator: "labeler".into(),
                reason: BusyReason::DurationExceedsMax,
            });
        }
        if self.rate_limited(now, max_per_minute) {
            return Err(CoreError::Busy {
                actuator: "labeler".into(),
                reason: BusyReason::RateLimited,
            });
        }

        *self.state.lock() = LabelerState::Active;
        let result = tokio::select! {
            r = self.drive_variant(duration, intensity) => r,
            _ = self.emergency_notify.notified() => {
                Err(CoreError::EmergencyLatched { actuator: "labeler".into() })
            }
        };

        match &result {
            Ok(()) => {
                self.health.lock().record_activation(duration);
                self.recent_activations.lock().push_back(now);
                *self.state.lock() = LabelerState::Idle;
            }
            Err(CoreError::EmergencyLatched { .. }) => {
                // emergency_stop already ran the release path and set Emergency.
            }
            Err(_) => {
                self.force_release();
                self.health.lock().record_error(now, false);
                *self.state.lock() = LabelerState::Error;
            }
        }
        result
    }

    fn rate_limited(&self, now: Instant, max_per_minute: u32) -> bool {
        let mut log = self.recent_activations.lock();
        let window = Duration::from_secs(60);
        while let Some(&front) = log.front() {
            if now.saturating_duration_since(front) > window {
                log.pop_front();
            } else {
                break;
            }
        }
        log.len() as u32 >= max_per_minute
    }

    async fn drive_variant(&self, duration: Duration, intensity: f64) -> Result<(), CoreError> {
        let intensity = intensity.clamp(0.0, 1.0);
        match self.config.variant {
            LabelerVariant::Solenoid => {
                self.hal
                    .pwm_start(self.config.pin, self.config.pwm_freq_hz, intensity)
                    .map_err(|e| hardware_fault(self.config.pin.0, e, false))?;
                tokio::time::sleep(duration).await;
                self.hal
                    .pwm_stop(self.config.pin)
                    .map_err(|e| hardware_fault(self.config.pin.0, e, false))?;
                Ok(())
            }
            LabelerVariant::Servo => {
                let activation_duty = duty_for_angle(
                    self.config.activation_angle_deg,
                    self.config.rest_angle_deg,
                    self.config.activation_angle_deg,
                );
                self.hal
                    .pwm_start(self.config.pin, self.config.pwm_freq_hz, activation_duty)
                    .map_err(|e| hardware_fault(self.config.pin.0, e, false))?;
                tokio::time::sleep(duration).await;
                let rest_duty = duty_for_angle(
                    self.config.rest_angle_deg,
                    self.config.rest_angle_deg,
                    self.config.activation_angle_deg,
                );
                self.hal
                    .pwm_set_duty(self.config.pin, rest_duty)
                    .map_err(|e| hardware_fault(self.config.pin.0, e, false))?;
                self.hal
                    .pwm_stop(self.config.pin)
                    .map_err(|e| hardware_fault(self.config.pin.0, e, false))?;
                Ok(())
            }
            LabelerVariant::Stepper => {
                let rate_hz = self.config.stepper_max_pulse_rate_hz * intensity;
                let pulses = (rate_hz * duration.as_secs_f64()).round().max(1.0) as u32;
                let period_us = if rate_hz > 0.0 { (1_000_000.0 / rate_hz) as u32 } else { 1_000 };
                let cancel = CancelToken::new();
                let handle = self
                    .hal
                    .pulse_train(self.config.pin, pulses, period_us, period_us / 2, cancel)
                    .map_err(|e| hardware_fault(self.config.pin.0, e, false))?;
                tokio::task::spawn_blocking(move || handle.join())
                    .await
                    .map_err(|_| CoreError::HardwareFault {
                        pin_or_actuator: "labeler".into(),
                        reason: "pulse train thread panicked".into(),
                        persistent: false,
                    })?;
                Ok(())
            }
        }
    }

    fn force_release(&self) {
        let _ = self.hal.pwm_stop(self.config.pin);
        let _ = self.hal.write(self.config.pin, Level::Low);
        if let Some(enable_pin) = self.config.enable_pin {
            let _ = self.hal.write(enable_pin, Level::Low);
        }
    }

    /// Idempotent: forces the release path and latches `Emergency`
    /// regardless of the current state or how many times this is
    /// called (§4.B, §8 "emergency_stop() is idempotent").
    pub fn emergency_stop(&self) {
        self.force_release();
        let mut state = self.state.lock();
        if *state != LabelerState::Emergency {
            warn!("labeler emergency stop engaged");
        }
        *state = LabelerState::Emergency;
        drop(state);
        self.emergency_notify.notify_waiters();
    }

    /// Clears `Emergency` back to `Idle` only after the release path
    /// has been re-verified; no-op outside `Emergency`.
    pub fn reset_emergency(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if *state != LabelerState::Emergency {
            return Ok(());
        }
        self.hal
            .write(self.config.pin, Level::Low)
            .map_err(|e| hardware_fault(self.config.pin.0, e, true))?;
        *state = LabelerState::Idle;
        info!("labeler emergency reset");
        Ok(())
    }

    /// Variant-specific calibration sweep (§4.B).
    pub async fn calibrate(&self) -> Result<(), CoreError> {
        {
            let mut state = self.state.lock();
            if *state == LabelerState::Emergency {
                return Err(CoreError::EmergencyLatched { actuator: "labeler".into() });
            }
            *state = LabelerState::Calibrating;
        }
        let result = match self.config.variant {
            LabelerVariant::Solenoid => {
                for step in [0.25, 0.5, 0.75, 1.0] {
                    self.drive_variant(Duration::from_millis(50), step).await?;
                }
                Ok(())
            }
            LabelerVariant::Servo => {
                self.drive_variant(Duration::from_millis(200), 1.0).await
            }
            LabelerVariant::Stepper => {
                self.drive_variant(Duration::from_millis(100), 0.5).await
            }
        };
        match &result {
            Ok(()) => *self.state.lock() = LabelerState::Idle,
            Err(_) => {
                self.force_release();
                *self.state.lock() = LabelerState::Error;
            }
        }
        result
    }
}

fn hardware_fault(pin: u32, e: visifruit_common::hal::driver::HalError, persistent: bool) -> CoreError {
    CoreError::HardwareFault {
        pin_or_actuator: format!("gpio{pin}"),
        reason: e.to_string(),
        persistent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visifruit_hal::drivers::simulation::SimulationHal;

    fn labeler() -> LabelerDriver {
        let hal: Arc<dyn ActuatorHal> = Arc::new(SimulationHal::new());
        LabelerDriver::new(hal, crate::config::test_support::sample_machine_config().labeler)
    }

    #[tokio::test]
    async fn init_brings_driver_to_idle() {
        let d = labeler();
        d.init().await.unwrap();
        assert_eq!(d.state(), LabelerState::Idle);
    }

    #[tokio::test]
    async fn activation_round_trips_to_idle_and_records_health() {
        let d = labeler();
        d.init().await.unwrap();
        d.activate_for(Duration::from_millis(5), 1.0, 90, 2.0, Instant::now())
            .await
            .unwrap();
        assert_eq!(d.state(), LabelerState::Idle);
        assert_eq!(d.health().activations, 1);
    }

    #[tokio::test]
    async fn concurrent_activation_is_rejected() {
        let d = Arc::new(labeler());
        d.init().await.unwrap();
        let d1 = d.clone();
        let first = tokio::spawn(async move {
            d1.activate_for(Duration::from_millis(50), 1.0, 90, 2.0, Instant::now()).await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = d.activate_for(Duration::from_millis(5), 1.0, 90, 2.0, Instant::now()).await;
        assert!(matches!(
            second,
            Err(CoreError::Busy { reason: BusyReason::AlreadyActive, .. })
        ));
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn duration_exceeding_max_is_rejected() {
        let d = labeler();
        d.init().await.unwrap();
        let err = d
            .activate_for(Duration::from_secs(3), 1.0, 90, 2.0, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Busy { reason: BusyReason::DurationExceedsMax, .. }
        ));
    }

    #[tokio::test]
    async fn emergency_stop_is_idempotent_and_latches() {
        let d = labeler();
        d.init().await.unwrap();
        d.emergency_stop();
        d.emergency_stop();
        assert_eq!(d.state(), LabelerState::Emergency);
        let err = d
            .activate_for(Duration::from_millis(5), 1.0, 90, 2.0, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::EmergencyLatched { .. }));
        d.reset_emergency().unwrap();
        assert_eq!(d.state(), LabelerState::Idle);
    }

    #[tokio::test]
    async fn rate_limit_rejects_after_cap_reached() {
        let d = labeler();
        d.init().await.unwrap();
        let now = Instant::now();
        for _ in 0..2 {
            d.activate_for(Duration::from_millis(1), 1.0, 2, 2.0, now).await.unwrap();
        }
        let err = d
            .activate_for(Duration::from_millis(1), 1.0, 2, 2.0, now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Busy { reason: BusyReason::RateLimited, .. }
        ));
    }
}

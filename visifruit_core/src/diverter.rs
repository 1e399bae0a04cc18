//! The Diverter Bank (§4.C): one servo per concrete [`FruitClass`],
//! each independently locked so different classes activate in
//! parallel while the same class rejects a concurrent request. The
//! three-phase move (drive+hold, smooth-or-direct return, PWM cut)
//! reuses the labeler's servo duty convention.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use visifruit_common::error::{BusyReason, CoreError};
use visifruit_common::hal::driver::ActuatorHal;
use visifruit_common::hal::types::{Level, PinMode};
use visifruit_common::types::{ActuatorHealth, FruitClass};

use crate::config::{DiverterBankConfig, DiverterClassConfig};

fn duty_for_angle(angle_deg: f64, rest_deg: f64, activation_deg: f64) -> f64 {
    let span = (activation_deg - rest_deg).abs().max(1.0);
    let frac = ((angle_deg - rest_deg) / span).clamp(0.0, 1.0);
    0.05 + frac * 0.05
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassState {
    Idle,
    Active,
    Emergency,
}

struct ClassDriver {
    config: DiverterClassConfig,
    state: Mutex<ClassState>,
    health: Mutex<ActuatorHealth>,
}

impl ClassDriver {
    fn new(config: DiverterClassConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ClassState::Idle),
            health: Mutex::new(ActuatorHealth::default()),
        }
    }
}

/// The full bank, one [`ClassDriver`] per concrete class (§4.C).
/// `Unknown` is masked out at construction — it has no diverter.
pub struct DiverterBank {
    hal: Arc<dyn ActuatorHal>,
    apple: ClassDriver,
    pear: ClassDriver,
    lemon: ClassDriver,
    smooth_steps: u16,
    hold_duration: Duration,
}

impl DiverterBank {
    pub fn new(hal: Arc<dyn ActuatorHal>, bank: &DiverterBankConfig, smooth_steps: u16, hold_duration: Duration) -> Self {
        Self {
            hal,
            apple: ClassDriver::new(bank.apple),
            pear: ClassDriver::new(bank.pear),
            lemon: ClassDriver::new(bank.lemon),
            smooth_steps,
            hold_duration,
        }
    }

    fn driver(&self, class: FruitClass) -> Option<&ClassDriver> {
        match class {
            FruitClass::Apple => Some(&self.apple),
            FruitClass::Pear => Some(&self.pear),
            FruitClass::Lemon => Some(&self.lemon),
            FruitClass::Unknown => None,
        }
    }

    pub fn health(&self, class: FruitClass) -> Option<ActuatorHealth> {
        self.driver(class).map(|d| *d.health.lock())
    }

    pub fn record_missed_deadline(&self, class: FruitClass) {
        if let Some(d) = self.driver(class) {
            d.health.lock().record_missed_deadline();
        }
    }

    pub fn init_all(&self) -> Result<(), CoreError> {
        for class in FruitClass::CONCRETE {
            let d = self.driver(class).expect("concrete class always has a driver");
            self.hal
                .set_pin_mode(d.config.pin, PinMode::Output { initial: Level::Low })
                .map_err(|e| CoreError::HardwareFault {
                    pin_or_actuator: format!("diverter[{class:?}]"),
                    reason: e.to_string(),
                    persistent: false,
                })?;
        }
        Ok(())
    }

    /// Activates the diverter for `class` (§4.C). `None` if the class
    /// is `Unknown` or disabled, mirroring §4.I step 5's "unless class
    /// is Unknown" masking; disabled classes behave the same way.
    pub async fn activate(&self, class: FruitClass, now: Instant) -> Option<Result<(), CoreError>> {
        let d = self.driver(class)?;
        if !d.config.enabled {
            return None;
        }

        {
            let mut state = d.state.lock();
            match *state {
                ClassState::Emergency => {
                    return Some(Err(CoreError::EmergencyLatched {
                        actuator: format!("diverter[{class:?}]"),
                    }));
                }
                ClassState::Active => {
                    return Some(Err(CoreError::Busy {
                        actuator: format!("diverter[{class:?}]"),
                        reason: BusyReason::AlreadyActive,
                    }));
                }
                ClassState::Idle => *state = ClassState::Active,
            }
        }

        let result = self.drive_and_return(d).await;
        match &result {
            Ok(()) => {
                d.health.lock().record_activation(self.hold_duration);
                *d.state.lock() = ClassState::Idle;
            }
            Err(_) => {
                self.force_release(d);
                d.health.lock().record_error(now, false);
                *d.state.lock() = ClassState::Idle;
            }
        }
        Some(result)
    }

    async fn drive_and_return(&self, d: &ClassDriver) -> Result<(), CoreError> {
        let activation_duty = duty_for_angle(d.config.activation_angle_deg, d.config.rest_angle_deg, d.config.activation_angle_deg);
        self.hal
            .pwm_start(d.config.pin, d.config.pwm_freq_hz, activation_duty)
            .map_err(|e| fault(d.config, e))?;
        tokio::time::sleep(self.hold_duration).await;

        let rest_duty = duty_for_angle(d.config.rest_angle_deg, d.config.rest_angle_deg, d.config.activation_angle_deg);
        if self.smooth_steps >= 2 {
            for step in 1..=self.smooth_steps {
                let frac = step as f64 / self.smooth_steps as f64;
                let duty = activation_duty + (rest_duty - activation_duty) * frac;
                self.hal.pwm_set_duty(d.config.pin, duty).map_err(|e| fault(d.config, e))?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        } else {
            self.hal.pwm_set_duty(d.config.pin, rest_duty).map_err(|e| fault(d.config, e))?;
        }

        self.hal.pwm_stop(d.config.pin).map_err(|e| fault(d.config, e))?;
        Ok(())
    }

    fn force_release(&self, d: &ClassDriver) {
        let _ = self.hal.pwm_stop(d.config.pin);
        let _ = self.hal.write(d.config.pin, Level::Low);
    }

    /// Latches every class into `Emergency`, idempotently (§8).
    pub fn emergency_stop_all(&self) {
        for class in FruitClass::CONCRETE {
            let d = self.driver(class).expect("concrete class always has a driver");
            self.force_release(d);
            let mut state = d.state.lock();
            if *state != ClassState::Emergency {
                warn!(?class, "diverter emergency stop engaged");
            }
            *state = ClassState::Emergency;
        }
    }

    pub fn reset_emergency_all(&self) {
        for class in FruitClass::CONCRETE {
            let d = self.driver(class).expect("concrete class always has a driver");
            let mut state = d.state.lock();
            if *state == ClassState::Emergency {
                *state = ClassState::Idle;
            }
        }
    }
}

fn fault(config: DiverterClassConfig, e: visifruit_common::hal::driver::HalError) -> CoreError {
    CoreError::HardwareFault {
        pin_or_actuator: format!("diverter[{:?}]", config.class),
        reason: e.to_string(),
        persistent: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visifruit_hal::drivers::simulation::SimulationHal;

    fn bank() -> DiverterBank {
        let hal: Arc<dyn ActuatorHal> = Arc::new(SimulationHal::new());
        let cfg = crate::config::test_support::sample_machine_config();
        DiverterBank::new(hal, &cfg.diverters, 4, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn unknown_class_never_activates() {
        let b = bank();
        assert!(b.activate(FruitClass::Unknown, Instant::now()).await.is_none());
    }

    #[tokio::test]
    async fn activation_round_trips_and_records_health() {
        let b = bank();
        b.init_all().unwrap();
        b.activate(FruitClass::Apple, Instant::now()).await.unwrap().unwrap();
        assert_eq!(b.health(FruitClass::Apple).unwrap().activations, 1);
    }

    #[tokio::test]
    async fn same_class_concurrent_activation_rejected_different_class_allowed() {
        let b = Arc::new(bank());
        b.init_all().unwrap();
        let b1 = b.clone();
        let apple_task = tokio::spawn(async move { b1.activate(FruitClass::Apple, Instant::now()).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let second_apple = b.activate(FruitClass::Apple, Instant::now()).await.unwrap();
        assert!(matches!(second_apple, Err(CoreError::Busy { reason: BusyReason::AlreadyActive, .. })));

        let pear = b.activate(FruitClass::Pear, Instant::now()).await.unwrap();
        assert!(pear.is_ok());

        apple_task.await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn emergency_stop_latches_and_reset_clears() {
        let b = bank();
        b.init_all().unwrap();
        b.emergency_stop_all();
        b.emergency_stop_all();
        let err = b.activate(FruitClass::Lemon, Instant::now()).await.unwrap();
        assert!(matches!(err, Err(CoreError::EmergencyLatched { .. })));
        b.reset_emergency_all();
        assert!(b.activate(FruitClass::Lemon, Instant::now()).await.unwrap().is_ok());
    }
}

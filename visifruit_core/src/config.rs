//! Machine configuration: the per-actuator variant selection and pin
//! assignments the core is constructed from alongside `Calibration`
//! (§1, §3). `Calibration` carries the tunable numbers every
//! scheduling pass reads; `MachineConfig` carries the one-time wiring
//! (which driver variant, which pins) that does not change at
//! runtime.
//!
//! Bounds are validated once at load time rather than deferred to the
//! first bad pin toggle, the same way the rest of the workspace's
//! config types fail fast on construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use visifruit_common::error::ConfigError;
use visifruit_common::hal::PinId;
use visifruit_common::types::FruitClass;

/// Which labeler actuator family is wired up (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelerVariant {
    Solenoid,
    Servo,
    Stepper,
}

/// Labeler driver wiring (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelerConfig {
    pub variant: LabelerVariant,
    /// Main actuation pin: PWM duty (solenoid/servo) or step pin (stepper).
    pub pin: PinId,
    /// Stepper direction pin; unused by solenoid/servo.
    pub direction_pin: Option<PinId>,
    /// Optional driver-enable line, deasserted on release (§7).
    pub enable_pin: Option<PinId>,
    pub pwm_freq_hz: f64,
    /// Servo rest angle, degrees.
    pub rest_angle_deg: f64,
    /// Servo activation angle, degrees.
    pub activation_angle_deg: f64,
    /// Stepper pulses per second at `intensity = 1.0`.
    pub stepper_max_pulse_rate_hz: f64,
}

impl LabelerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.variant == LabelerVariant::Stepper && self.direction_pin.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "labeler.direction_pin (required for stepper variant)",
            });
        }
        if self.pwm_freq_hz <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "labeler.pwm_freq_hz",
                reason: format!("must be > 0, got {}", self.pwm_freq_hz),
            });
        }
        if self.variant == LabelerVariant::Stepper && self.stepper_max_pulse_rate_hz <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "labeler.stepper_max_pulse_rate_hz",
                reason: format!("must be > 0, got {}", self.stepper_max_pulse_rate_hz),
            });
        }
        Ok(())
    }
}

/// One diverter servo's wiring (§4.C). Every concrete [`FruitClass`]
/// has exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiverterClassConfig {
    pub class: FruitClass,
    pub pin: PinId,
    pub pwm_freq_hz: f64,
    pub rest_angle_deg: f64,
    pub activation_angle_deg: f64,
    /// Whether this class's diverter is enabled at boot; `Diverter(Enable(class,
    /// bool))` (§4.J) overrides this at runtime.
    pub enabled: bool,
}

impl DiverterClassConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.class.is_unknown() {
            return Err(ConfigError::Inconsistent {
                field: "diverter.class",
                reason: "Unknown never has a diverter".into(),
            });
        }
        if self.pwm_freq_hz <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "diverter.pwm_freq_hz",
                reason: format!("must be > 0, got {}", self.pwm_freq_hz),
            });
        }
        Ok(())
    }
}

/// The full bank: one driver per concrete [`FruitClass`] (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiverterBankConfig {
    pub apple: DiverterClassConfig,
    pub pear: DiverterClassConfig,
    pub lemon: DiverterClassConfig,
}

impl DiverterBankConfig {
    pub fn get(&self, class: FruitClass) -> Option<&DiverterClassConfig> {
        match class {
            FruitClass::Apple => Some(&self.apple),
            FruitClass::Pear => Some(&self.pear),
            FruitClass::Lemon => Some(&self.lemon),
            FruitClass::Unknown => None,
        }
    }

    pub fn get_mut(&mut self, class: FruitClass) -> Option<&mut DiverterClassConfig> {
        match class {
            FruitClass::Apple => Some(&mut self.apple),
            FruitClass::Pear => Some(&mut self.pear),
            FruitClass::Lemon => Some(&mut self.lemon),
            FruitClass::Unknown => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.apple.validate()?;
        self.pear.validate()?;
        self.lemon.validate()?;
        Ok(())
    }
}

/// Which belt motor topology is wired up (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeltVariant {
    RelayHBridge,
    PwmHBridge,
    StepPulsed,
}

/// Belt controller wiring (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeltConfig {
    pub variant: BeltVariant,
    pub forward_pin: PinId,
    pub reverse_pin: PinId,
    pub enable_pin: Option<PinId>,
    pub pwm_freq_hz: f64,
    /// Forced dwell at Stop between direction changes, preventing
    /// shoot-through on relay variants (§4.D). Not negotiable by
    /// callers.
    pub direction_change_quiescence_ms: u64,
}

impl BeltConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.variant == BeltVariant::PwmHBridge && self.pwm_freq_hz <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "belt.pwm_freq_hz",
                reason: format!("must be > 0, got {}", self.pwm_freq_hz),
            });
        }
        Ok(())
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.direction_change_quiescence_ms)
    }
}

/// Trigger sensor wiring (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    pub pin: PinId,
    pub debounce_ms: u64,
    pub poll_period_ms: u64,
    /// Observation window for each auto-calibration phase, seconds.
    pub auto_cal_window_s: f64,
}

impl SensorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auto_cal_window_s <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "sensor.auto_cal_window_s",
                reason: format!("must be > 0, got {}", self.auto_cal_window_s),
            });
        }
        Ok(())
    }
}

/// The full machine wiring: every actuator's variant, pins, and
/// backend selection. Constructed once at startup alongside
/// `Calibration`; never hot-reloaded (§1, §5: hardware pins are
/// exclusively owned and never reassigned at runtime).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    pub hal_backend: String,
    pub labeler: LabelerConfig,
    pub diverters: DiverterBankConfig,
    pub belt: BeltConfig,
    pub sensor: SensorConfig,
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.labeler.validate()?;
        self.diverters.validate()?;
        self.belt.validate()?;
        self.sensor.validate()?;
        Ok(())
    }
}

/// Sample machine wiring, public so integration tests, benches, and
/// the runtime's own doc examples can reuse it without duplicating
/// pin assignments.
pub mod test_support {
    use super::*;

    pub fn sample_machine_config() -> MachineConfig {
        MachineConfig {
            hal_backend: "simulation".into(),
            labeler: LabelerConfig {
                variant: LabelerVariant::Solenoid,
                pin: PinId(10),
                direction_pin: None,
                enable_pin: Some(PinId(11)),
                pwm_freq_hz: 200.0,
                rest_angle_deg: 0.0,
                activation_angle_deg: 0.0,
                stepper_max_pulse_rate_hz: 0.0,
            },
            diverters: DiverterBankConfig {
                apple: DiverterClassConfig {
                    class: FruitClass::Apple,
                    pin: PinId(20),
                    pwm_freq_hz: 50.0,
                    rest_angle_deg: 0.0,
                    activation_angle_deg: 90.0,
                    enabled: true,
                },
                pear: DiverterClassConfig {
                    class: FruitClass::Pear,
                    pin: PinId(21),
                    pwm_freq_hz: 50.0,
                    rest_angle_deg: 0.0,
                    activation_angle_deg: 90.0,
                    enabled: true,
                },
                lemon: DiverterClassConfig {
                    class: FruitClass::Lemon,
                    pin: PinId(22),
                    pwm_freq_hz: 50.0,
                    rest_angle_deg: 0.0,
                    activation_angle_deg: 90.0,
                    enabled: true,
                },
            },
            belt: BeltConfig {
                variant: BeltVariant::RelayHBridge,
                forward_pin: PinId(30),
                reverse_pin: PinId(31),
                enable_pin: Some(PinId(32)),
                pwm_freq_hz: 0.0,
                direction_change_quiescence_ms: 100,
            },
            sensor: SensorConfig {
                pin: PinId(40),
                debounce_ms: 20,
                poll_period_ms: 5,
                auto_cal_window_s: 3.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::sample_machine_config;
    use super::*;

    #[test]
    fn sample_config_validates() {
        assert!(sample_machine_config().validate().is_ok());
    }

    #[test]
    fn stepper_without_direction_pin_rejected() {
        let mut cfg = sample_machine_config();
        cfg.labeler.variant = LabelerVariant::Stepper;
        cfg.labeler.direction_pin = None;
        cfg.labeler.stepper_max_pulse_rate_hz = 1000.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn diverter_bank_get_excludes_unknown() {
        let cfg = sample_machine_config();
        assert!(cfg.diverters.get(FruitClass::Unknown).is_none());
        assert!(cfg.diverters.get(FruitClass::Apple).is_some());
    }
}

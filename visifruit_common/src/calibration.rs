//! The `Calibration` snapshot (§3) and its validation.
//!
//! A plain `serde` structure with `deny_unknown_fields`,
//! `#[serde(default = "fn")]` helpers for genuinely optional fields,
//! and a `validate()` that returns descriptive [`ConfigError`]s rather
//! than panicking. Nothing here loads a file: the core is constructed
//! from an already-parsed `Calibration` value (§1, §6) — file loading
//! is the wrapper's job.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-class diverter downstream offsets, in meters from the camera
/// origin along the belt. `Unknown` has no diverter and is therefore
/// not represented here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiverterOffsets {
    pub apple_m: f64,
    pub pear_m: f64,
    pub lemon_m: f64,
}

impl DiverterOffsets {
    pub fn get(&self, class: crate::types::FruitClass) -> Option<f64> {
        use crate::types::FruitClass::*;
        match class {
            Apple => Some(self.apple_m),
            Pear => Some(self.pear_m),
            Lemon => Some(self.lemon_m),
            Unknown => None,
        }
    }
}

/// Deduplication tunables (§4.H), all hot-reloadable as one atomic
/// snapshot swap (§4.J `Dedup(...)`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DedupConfig {
    /// IoU threshold above which two detections are the same fruit.
    pub iou_threshold: f64,
    /// Pixel-distance threshold between centers, as an alternative
    /// duplicate test to IoU.
    pub center_distance_px: f64,
    /// Ring window, in seconds, within which a prior detection is
    /// still eligible to match.
    pub window_s: f64,
    /// Per-frame accepted-detection cap (defends against noise
    /// bursts).
    pub max_per_frame: u32,
}

fn default_safety_margin_s() -> f64 {
    0.05
}

fn default_smooth_steps() -> u16 {
    crate::consts::SMOOTH_STEPS_DEFAULT
}

fn default_labeler_intensity() -> f64 {
    1.0
}

/// The full timing/geometry/tunable snapshot the scheduler reads on
/// every pass. All fields are mutable only through the Control-Channel
/// (§4.J); readers observe a consistent snapshot per scheduling pass
/// (§3, §5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Calibration {
    pub belt_speed_m_per_s: f64,
    pub pixels_per_meter_x: f64,
    pub pixels_per_meter_y: f64,
    pub camera_origin_x_m: f64,
    pub camera_origin_y_m: f64,
    pub labeler_offset_m: f64,
    pub diverter_offsets_m: DiverterOffsets,

    pub cluster_eps_m: f64,
    pub cluster_min_samples: u32,

    pub base_activation_s: f64,
    pub per_fruit_extra_s: f64,
    #[serde(default = "default_safety_margin_s")]
    pub safety_margin_s: f64,
    /// Labeler PWM/duty intensity, mutated live by `Labeler(SetIntensity(i))`
    /// (§4.J); takes effect from the next cluster (§4.G).
    #[serde(default = "default_labeler_intensity")]
    pub labeler_intensity: f64,

    pub dedup: DedupConfig,

    /// Required, no default (§9 Open Questions: source has
    /// inconsistent 60 vs 120 defaults).
    pub labeler_max_activations_per_minute: u32,
    pub diverter_max_activations_per_minute: u32,

    pub labeler_max_activation_time_s: f64,
    pub diverter_hold_duration_s: f64,

    #[serde(default = "default_smooth_steps")]
    pub smooth_steps: u16,

    pub belt_safety_timeout_s: f64,
}

impl Calibration {
    /// Validates all bounds and cross-field consistency, returning
    /// every reason as a distinct, human-readable [`ConfigError`]
    /// rather than stopping at the first failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn require_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
            if value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::OutOfRange {
                    field,
                    reason: format!("must be > 0, got {value}"),
                })
            }
        }

        require_positive("belt_speed_m_per_s", self.belt_speed_m_per_s)?;
        require_positive("pixels_per_meter_x", self.pixels_per_meter_x)?;
        require_positive("pixels_per_meter_y", self.pixels_per_meter_y)?;
        require_positive("cluster_eps_m", self.cluster_eps_m)?;
        require_positive("base_activation_s", self.base_activation_s)?;
        require_positive("labeler_max_activation_time_s", self.labeler_max_activation_time_s)?;
        require_positive("diverter_hold_duration_s", self.diverter_hold_duration_s)?;

        if self.per_fruit_extra_s < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "per_fruit_extra_s",
                reason: format!("must be >= 0, got {}", self.per_fruit_extra_s),
            });
        }
        if self.safety_margin_s < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "safety_margin_s",
                reason: format!("must be >= 0, got {}", self.safety_margin_s),
            });
        }
        if !(0.0..=1.0).contains(&self.labeler_intensity) {
            return Err(ConfigError::OutOfRange {
                field: "labeler_intensity",
                reason: format!("must be in [0,1], got {}", self.labeler_intensity),
            });
        }
        if self.cluster_min_samples == 0 {
            return Err(ConfigError::OutOfRange {
                field: "cluster_min_samples",
                reason: "must be >= 1".into(),
            });
        }

        if self.labeler_max_activations_per_minute == 0 {
            return Err(ConfigError::MissingRequired {
                field: "labeler_max_activations_per_minute",
            });
        }
        if self.diverter_max_activations_per_minute == 0 {
            return Err(ConfigError::MissingRequired {
                field: "diverter_max_activations_per_minute",
            });
        }

        if !(crate::consts::SMOOTH_STEPS_MIN..=crate::consts::SMOOTH_STEPS_MAX)
            .contains(&self.smooth_steps)
        {
            return Err(ConfigError::OutOfRange {
                field: "smooth_steps",
                reason: format!(
                    "must be in {}..={}, got {}",
                    crate::consts::SMOOTH_STEPS_MIN,
                    crate::consts::SMOOTH_STEPS_MAX,
                    self.smooth_steps
                ),
            });
        }

        if !(0.0..=1.0).contains(&self.dedup.iou_threshold) {
            return Err(ConfigError::OutOfRange {
                field: "dedup.iou_threshold",
                reason: format!("must be in [0,1], got {}", self.dedup.iou_threshold),
            });
        }
        if self.dedup.center_distance_px < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "dedup.center_distance_px",
                reason: format!("must be >= 0, got {}", self.dedup.center_distance_px),
            });
        }
        if self.dedup.window_s <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "dedup.window_s",
                reason: format!("must be > 0, got {}", self.dedup.window_s),
            });
        }
        if self.dedup.max_per_frame == 0 {
            return Err(ConfigError::OutOfRange {
                field: "dedup.max_per_frame",
                reason: "must be >= 1".into(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Calibration {
        Calibration {
            belt_speed_m_per_s: 0.15,
            pixels_per_meter_x: 2560.0,
            pixels_per_meter_y: 2560.0,
            camera_origin_x_m: 0.0,
            camera_origin_y_m: 0.2,
            labeler_offset_m: 0.80,
            diverter_offsets_m: DiverterOffsets {
                apple_m: 0.95,
                pear_m: 1.0,
                lemon_m: 1.05,
            },
            cluster_eps_m: 0.08,
            cluster_min_samples: 1,
            base_activation_s: 0.2,
            per_fruit_extra_s: 0.15,
            safety_margin_s: 0.05,
            labeler_intensity: 1.0,
            dedup: DedupConfig {
                iou_threshold: 0.3,
                center_distance_px: 20.0,
                window_s: 1.0,
                max_per_frame: 32,
            },
            labeler_max_activations_per_minute: 90,
            diverter_max_activations_per_minute: 90,
            labeler_max_activation_time_s: 2.0,
            diverter_hold_duration_s: 0.3,
            smooth_steps: 15,
            belt_safety_timeout_s: 5.0,
        }
    }

    #[test]
    fn valid_calibration_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn zero_belt_speed_rejected() {
        let mut c = sample();
        c.belt_speed_m_per_s = 0.0;
        assert!(matches!(c.validate(), Err(ConfigError::OutOfRange { field: "belt_speed_m_per_s", .. })));
    }

    #[test]
    fn missing_rate_limit_rejected() {
        let mut c = sample();
        c.labeler_max_activations_per_minute = 0;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::MissingRequired {
                field: "labeler_max_activations_per_minute"
            })
        ));
    }

    #[test]
    fn smooth_steps_out_of_range_rejected() {
        let mut c = sample();
        c.smooth_steps = 30;
        assert!(c.validate().is_err());
    }

    #[test]
    fn diverter_offsets_lookup_excludes_unknown() {
        let c = sample();
        assert_eq!(c.diverter_offsets_m.get(crate::types::FruitClass::Unknown), None);
        assert_eq!(c.diverter_offsets_m.get(crate::types::FruitClass::Apple), Some(0.95));
    }
}

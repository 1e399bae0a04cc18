//! Shared calibration fixtures, reused by this crate's unit tests,
//! its integration tests under `tests/`, and its `benches/`.

use visifruit_common::calibration::{Calibration, DedupConfig, DiverterOffsets};

pub fn sample_calibration() -> Calibration {
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

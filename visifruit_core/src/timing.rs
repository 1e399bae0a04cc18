//! The timing model (§4.G): pixel→world is the grouper's job
//! ([`crate::grouper`]); this module turns a [`Cluster`] plus the
//! current [`Calibration`] snapshot into a delay and duration on the
//! monotonic clock. Wall clock is never consulted.

use std::time::{Duration, Instant};

use visifruit_common::calibration::Calibration;
use visifruit_common::error::CoreError;
use visifruit_common::consts::HIGH_DENSITY_THRESHOLD;
use visifruit_common::types::{ActivationCommand, ActuatorTarget, Cluster};

/// `base_activation + (size-1)*per_fruit_extra + safety_margin`,
/// scaled by the row/column spread and high-density multipliers
/// (§4.G). Shared by both the labeler and diverter calculations: one
/// formula, applied at two offsets.
pub fn activation_duration(cluster: &Cluster, cal: &Calibration) -> Duration {
    let size = cluster.size() as f64;
    let mut seconds = cal.base_activation_s + (size - 1.0) * cal.per_fruit_extra_s + cal.safety_margin_s;
    seconds *= 1.0 + 0.3 * (cluster.rows as f64 - 1.0);
    seconds *= 1.0 + 0.2 * (cluster.cols as f64 - 1.0);
    if cluster.density > HIGH_DENSITY_THRESHOLD {
        seconds *= 1.4;
    }
    Duration::from_secs_f64(seconds.max(0.0))
}

fn travel_time_s(offset_m: f64, cluster_center_y_m: f64, belt_speed_m_per_s: f64) -> f64 {
    (offset_m - cluster_center_y_m) / belt_speed_m_per_s
}

/// Computes the labeler [`ActivationCommand`] for one cluster, or
/// `CoreError::Late` if the cluster has already passed the labeler
/// (§4.G: "If travel_time < 0 the cluster has passed; the scheduler
/// drops it with a late diagnostic").
pub fn labeler_command(
    cluster: &Cluster,
    cal: &Calibration,
    now: Instant,
) -> Result<ActivationCommand, CoreError> {
    let travel_s = travel_time_s(cal.labeler_offset_m, cluster.center_m.1, cal.belt_speed_m_per_s);
    if travel_s < 0.0 {
        return Err(CoreError::Late {
            actuator: "labeler".into(),
            by: Duration::from_secs_f64(-travel_s),
        });
    }
    Ok(ActivationCommand {
        target: ActuatorTarget::Labeler,
        fire_at: now + Duration::from_secs_f64(travel_s),
        duration: activation_duration(cluster, cal),
        intensity: cal.labeler_intensity,
        origin_cluster_id: cluster.cluster_id,
    })
}

/// Computes the diverter [`ActivationCommand`] for one cluster's
/// `predominant_class`. Returns `None` if the class is `Unknown`
/// (§4.I step 5: "unless class is Unknown").
pub fn diverter_command(
    cluster: &Cluster,
    cal: &Calibration,
    now: Instant,
) -> Option<Result<ActivationCommand, CoreError>> {
    let class = cluster.predominant_class;
    let offset_m = cal.diverter_offsets_m.get(class)?;
    let travel_s = travel_time_s(offset_m, cluster.center_m.1, cal.belt_speed_m_per_s);
    if travel_s < 0.0 {
        return Some(Err(CoreError::Late {
            actuator: format!("diverter[{class:?}]"),
            by: Duration::from_secs_f64(-travel_s),
        }));
    }
    Some(Ok(ActivationCommand {
        target: ActuatorTarget::Diverter(class),
        fire_at: now + Duration::from_secs_f64(travel_s),
        duration: activation_duration(cluster, cal),
        intensity: 1.0,
        origin_cluster_id: cluster.cluster_id,
    }))
}

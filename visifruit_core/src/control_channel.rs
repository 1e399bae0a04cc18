//! The Control-Channel (§4.J): a small cooperative consumer of
//! external commands. Message application is idempotent by
//! `updated_at`, delegated to [`crate::scheduler::Orchestrator::apply_if_newer`].
//! The shim that sources these messages from a file/IPC channel is
//! outside the core (§6).

use visifruit_common::types::FruitClass;

use crate::belt::BeltError;
use crate::scheduler::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BeltCommand {
    Start { direction: visifruit_common::types::Direction, speed_fraction: f64 },
    Stop,
    Emergency,
    SetSpeed(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LabelerCommand {
    SetIntensity(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DedupCommand {
    SetIoU(f64),
    SetCenterDist(f64),
    SetWindow(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SafetyCommand {
    SetBeltTimeout(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiverterCommand {
    Enable(FruitClass, bool),
}

/// One Control-Channel message, tagged with a monotonically
/// increasing version (§4.J "updated_at").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlMessage {
    pub updated_at: u64,
    pub body: ControlBody,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlBody {
    Belt(BeltCommand),
    Labeler(LabelerCommand),
    Dedup(DedupCommand),
    Safety(SafetyCommand),
    Diverter(DiverterCommand),
}

/// Error surfaced by a Control-Channel message that could not be
/// forwarded to its target (e.g. `SetSpeed` on a non-PWM belt).
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Belt(#[from] BeltError),
}

/// Applies one message against the orchestrator and its drivers,
/// returning `false` without side effects if `updated_at` was not
/// newer than the last applied value (§4.J, §8 idempotence).
pub async fn apply(
    orchestrator: &Orchestrator,
    belt: &std::sync::Arc<crate::belt::BeltController>,
    msg: ControlMessage,
) -> Result<bool, ControlError> {
    let ControlMessage { updated_at, body } = msg;

    // Belt and Diverter(Enable) commands need `.await`/fallible paths
    // the synchronous `apply_if_newer` closure can't run; version-gate
    // them the same way by hand.
    match body {
        ControlBody::Belt(cmd) => {
            if !gate(orchestrator, updated_at) {
                return Ok(false);
            }
            match cmd {
                BeltCommand::Start { direction, speed_fraction } => {
                    belt.start(direction, speed_fraction).await.map_err(BeltError::Core)?;
                }
                BeltCommand::Stop => {
                    belt.stop().await.map_err(BeltError::Core)?;
                }
                BeltCommand::Emergency => belt.emergency_stop(),
                BeltCommand::SetSpeed(fraction) => belt.set_speed(fraction)?,
            }
            Ok(true)
        }
        ControlBody::Labeler(LabelerCommand::SetIntensity(intensity)) => {
            Ok(orchestrator.apply_if_newer(updated_at, |o| {
                let mut cal = (*o.calibration()).clone();
                cal.labeler_intensity = intensity.clamp(0.0, 1.0);
                o.set_calibration(cal);
            }))
        }
        ControlBody::Dedup(cmd) => Ok(orchestrator.apply_if_newer(updated_at, |o| {
            let mut cal = (*o.calibration()).clone();
            match cmd {
                DedupCommand::SetIoU(v) => cal.dedup.iou_threshold = v,
                DedupCommand::SetCenterDist(v) => cal.dedup.center_distance_px = v,
                DedupCommand::SetWindow(v) => cal.dedup.window_s = v,
            }
            o.set_calibration(cal);
        })),
        ControlBody::Safety(SafetyCommand::SetBeltTimeout(d)) => {
            if !gate(orchestrator, updated_at) {
                return Ok(false);
            }
            let timeout = if d <= 0.0 {
                std::time::Duration::ZERO
            } else {
                std::time::Duration::from_secs_f64(d)
            };
            belt.set_safety_timeout(timeout);
            Ok(true)
        }
        ControlBody::Diverter(DiverterCommand::Enable(class, enabled)) => {
            Ok(orchestrator.apply_if_newer(updated_at, |o| o.set_diverter_enabled(class, enabled)))
        }
    }
}

fn gate(orchestrator: &Orchestrator, updated_at: u64) -> bool {
    orchestrator.apply_if_newer(updated_at, |_| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use visifruit_common::hal::driver::ActuatorHal;
    use visifruit_hal::drivers::simulation::SimulationHal;

    fn setup() -> (Orchestrator, Arc<crate::belt::BeltController>) {
        let hal: Arc<dyn ActuatorHal> = Arc::new(SimulationHal::new());
        let machine = crate::config::test_support::sample_machine_config();
        let labeler = Arc::new(crate::labeler::LabelerDriver::new(hal.clone(), machine.labeler));
        let diverters = Arc::new(crate::diverter::DiverterBank::new(hal.clone(), &machine.diverters, 4, Duration::from_millis(5)));
        let belt = crate::belt::BeltController::new(hal, machine.belt, Duration::from_secs(5));
        let orchestrator = Orchestrator::new(labeler, diverters, belt.clone(), crate::test_support::sample_calibration());
        (orchestrator, belt)
    }

    #[tokio::test]
    async fn set_intensity_updates_calibration_snapshot() {
        let (o, belt) = setup();
        let applied = apply(
            &o,
            &belt,
            ControlMessage { updated_at: 1, body: ControlBody::Labeler(LabelerCommand::SetIntensity(0.5)) },
        )
        .await
        .unwrap();
        assert!(applied);
        assert_eq!(o.calibration().labeler_intensity, 0.5);
    }

    #[tokio::test]
    async fn stale_updated_at_is_ignored() {
        let (o, belt) = setup();
        apply(&o, &belt, ControlMessage { updated_at: 5, body: ControlBody::Labeler(LabelerCommand::SetIntensity(0.5)) })
            .await
            .unwrap();
        let applied = apply(
            &o,
            &belt,
            ControlMessage { updated_at: 5, body: ControlBody::Labeler(LabelerCommand::SetIntensity(0.9)) },
        )
        .await
        .unwrap();
        assert!(!applied);
        assert_eq!(o.calibration().labeler_intensity, 0.5);
    }

    #[tokio::test]
    async fn belt_start_command_is_forwarded() {
        let (o, belt) = setup();
        apply(
            &o,
            &belt,
            ControlMessage {
                updated_at: 1,
                body: ControlBody::Belt(BeltCommand::Start {
                    direction: visifruit_common::types::Direction::Forward,
                    speed_fraction: 1.0,
                }),
            },
        )
        .await
        .unwrap();
        assert_eq!(belt.snapshot(), visifruit_common::types::BeltState::Running(visifruit_common::types::Direction::Forward));
    }
}

//! Cross-module integration tests driving the full detection →
//! dedup → cluster → schedule → dispatch pipeline (§4.I) against real
//! [`LabelerDriver`]/[`DiverterBank`]/[`BeltController`] instances over
//! a [`SimulationHal`], rather than exercising any one module alone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use visifruit_common::calibration::Calibration;
use visifruit_common::hal::driver::ActuatorHal;
use visifruit_common::types::{BBoxPx, Direction, FruitClass, RawDetection};
use visifruit_core::belt::BeltController;
use visifruit_core::config::test_support::sample_machine_config;
use visifruit_core::control_channel::{self, BeltCommand, ControlBody, ControlMessage};
use visifruit_core::diverter::DiverterBank;
use visifruit_core::labeler::{LabelerDriver, LabelerState};
use visifruit_core::scheduler::Orchestrator;
use visifruit_core::test_support::sample_calibration;
use visifruit_hal::drivers::simulation::SimulationHal;

struct Rig {
    orchestrator: Orchestrator,
    belt: Arc<BeltController>,
    labeler: Arc<LabelerDriver>,
}

async fn rig(calibration: Calibration) -> Rig {
    let hal: Arc<dyn ActuatorHal> = Arc::new(SimulationHal::new());
    let machine = sample_machine_config();
    let labeler = Arc::new(LabelerDriver::new(hal.clone(), machine.labeler));
    let diverters = Arc::new(DiverterBank::new(hal.clone(), &machine.diverters, 4, Duration::from_millis(5)));
    let belt = BeltController::new(hal, machine.belt, Duration::from_millis(50));

    labeler.init().await.unwrap();
    diverters.init_all().unwrap();
    belt.init().unwrap();

    let labeler_handle = labeler.clone();
    let belt_handle = belt.clone();
    let orchestrator = Orchestrator::new(labeler, diverters, belt.clone(), calibration);
    Rig { orchestrator, belt: belt_handle, labeler: labeler_handle }
}

fn detection(class: FruitClass, x_px: f64, y_px: f64, t: Instant) -> RawDetection {
    RawDetection {
        class,
        confidence: 0.9,
        bbox_px: BBoxPx { x1: x_px - 5.0, y1: y_px - 5.0, x2: x_px + 5.0, y2: y_px + 5.0 },
        frame_time: t,
    }
}

#[tokio::test]
async fn single_cluster_dispatches_labeler_and_diverter_end_to_end() {
    let rig = rig(sample_calibration()).await;
    let t = Instant::now();
    rig.orchestrator.ingest_frame(vec![detection(FruitClass::Apple, 256.0, 1024.0, t)], t);
    rig.orchestrator.dispatch_ready(t + Duration::from_secs(10)).await;

    let stats = rig.orchestrator.stats();
    assert_eq!(stats.dispatched, 2, "both labeler and diverter commands should dispatch");
    assert_eq!(stats.overlap_dropped, 0);
    assert_eq!(stats.missed_deadline, 0);
}

#[tokio::test]
async fn same_fruit_seen_across_two_frames_is_not_double_dispatched() {
    let rig = rig(sample_calibration()).await;
    let t0 = Instant::now();
    let d = detection(FruitClass::Apple, 256.0, 1024.0, t0);

    rig.orchestrator.ingest_frame(vec![d.clone()], t0);
    // Same fruit, barely-moved bbox, next frame within the dedup window:
    // must be suppressed rather than scheduled a second time (§4.H).
    let t1 = t0 + Duration::from_millis(30);
    let mut again = d;
    again.frame_time = t1;
    rig.orchestrator.ingest_frame(vec![again], t1);

    rig.orchestrator.dispatch_ready(t1 + Duration::from_secs(10)).await;
    let stats = rig.orchestrator.stats();
    assert_eq!(stats.dispatched, 2, "one cluster's worth of commands, not two");
}

#[tokio::test]
async fn belt_safety_timeout_auto_stops_without_explicit_stop_call() {
    let rig = rig(sample_calibration()).await;
    rig.belt.start(Direction::Forward, 1.0).await.unwrap();
    assert_eq!(rig.belt.snapshot(), visifruit_common::types::BeltState::Running(Direction::Forward));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(rig.belt.snapshot(), visifruit_common::types::BeltState::Idle);
}

#[tokio::test]
async fn orchestrator_emergency_stop_forces_release_path_after_dispatch() {
    let rig = rig(sample_calibration()).await;
    rig.belt.start(Direction::Forward, 1.0).await.unwrap();
    let t = Instant::now();
    rig.orchestrator.ingest_frame(vec![detection(FruitClass::Apple, 256.0, 1024.0, t)], t);
    rig.orchestrator.dispatch_ready(t + Duration::from_secs(10)).await;

    rig.orchestrator.emergency_stop();

    assert_eq!(rig.labeler.state(), LabelerState::Emergency);
    assert_eq!(rig.belt.snapshot(), visifruit_common::types::BeltState::Emergency);
    assert_eq!(rig.orchestrator.stats().dispatched, 2);

    // Emergency is idempotent and a fresh command after it is rejected.
    rig.orchestrator.emergency_stop();
    let activation = rig.labeler.activate_for(Duration::from_millis(10), 1.0, 90, 2.0, Instant::now()).await;
    assert!(matches!(activation, Err(visifruit_common::error::CoreError::EmergencyLatched { .. })));
}

#[tokio::test]
async fn control_channel_belt_commands_are_idempotent_by_version() {
    let rig = rig(sample_calibration()).await;

    let start = ControlMessage {
        updated_at: 10,
        body: ControlBody::Belt(BeltCommand::Start { direction: Direction::Forward, speed_fraction: 0.5 }),
    };
    let applied = control_channel::apply(&rig.orchestrator, &rig.belt, start).await.unwrap();
    assert!(applied);
    assert_eq!(rig.belt.snapshot(), visifruit_common::types::BeltState::Running(Direction::Forward));

    // A stale message (same or older `updated_at`) must be a no-op.
    let stale_stop = ControlMessage { updated_at: 10, body: ControlBody::Belt(BeltCommand::Stop) };
    let applied = control_channel::apply(&rig.orchestrator, &rig.belt, stale_stop).await.unwrap();
    assert!(!applied);
    assert_eq!(rig.belt.snapshot(), visifruit_common::types::BeltState::Running(Direction::Forward));

    let newer_stop = ControlMessage { updated_at: 11, body: ControlBody::Belt(BeltCommand::Stop) };
    let applied = control_channel::apply(&rig.orchestrator, &rig.belt, newer_stop).await.unwrap();
    assert!(applied);
    assert_eq!(rig.belt.snapshot(), visifruit_common::types::BeltState::Idle);
}

#[tokio::test]
async fn disabling_diverter_class_masks_its_commands_but_not_the_labeler() {
    let rig = rig(sample_calibration()).await;
    rig.orchestrator.set_diverter_enabled(FruitClass::Apple, false);

    let t = Instant::now();
    rig.orchestrator.ingest_frame(vec![detection(FruitClass::Apple, 256.0, 1024.0, t)], t);
    rig.orchestrator.dispatch_ready(t + Duration::from_secs(10)).await;

    assert_eq!(rig.orchestrator.stats().dispatched, 1, "labeler only, diverter masked");
}

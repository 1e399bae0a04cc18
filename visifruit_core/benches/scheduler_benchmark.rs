//! Scheduler dispatch benchmark: measures one `ingest_frame` +
//! `dispatch_ready` pass as the pending-command count grows, covering
//! the orchestrator's per-frame pipeline (§4.I).

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use visifruit_common::hal::driver::ActuatorHal;
use visifruit_common::types::{BBoxPx, FruitClass, RawDetection};
use visifruit_core::belt::BeltController;
use visifruit_core::config::test_support::sample_machine_config;
use visifruit_core::diverter::DiverterBank;
use visifruit_core::labeler::LabelerDriver;
use visifruit_core::scheduler::Orchestrator;
use visifruit_core::test_support::sample_calibration;
use visifruit_hal::drivers::simulation::SimulationHal;

fn orchestrator(rt: &tokio::runtime::Runtime) -> Orchestrator {
    let hal: Arc<dyn ActuatorHal> = Arc::new(SimulationHal::new());
    let machine = sample_machine_config();
    let labeler = Arc::new(LabelerDriver::new(hal.clone(), machine.labeler));
    let diverters = Arc::new(DiverterBank::new(hal.clone(), &machine.diverters, 4, Duration::from_millis(1)));
    let belt = BeltController::new(hal, machine.belt, Duration::from_secs(5));
    rt.block_on(async {
        labeler.init().await.unwrap();
        diverters.init_all().unwrap();
    });
    Orchestrator::new(labeler, diverters, belt, sample_calibration())
}

/// `n` well-separated apple clusters spread along the belt so each
/// yields its own label + diverter command pair.
fn detections_for(n: usize, t: Instant) -> Vec<RawDetection> {
    (0..n)
        .map(|i| {
            let y = 200.0 + i as f64 * 400.0;
            RawDetection {
                class: FruitClass::Apple,
                confidence: 0.9,
                bbox_px: BBoxPx { x1: 240.0, y1: y, x2: 280.0, y2: y + 40.0 },
                frame_time: t,
            }
        })
        .collect()
}

fn bench_dispatch_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("orchestrator_dispatch_cycle");
    group.significance_level(0.01);
    group.sample_size(100);

    for &n in &[1usize, 4, 16, 64] {
        group.bench_with_input(BenchmarkId::new("clusters", n), &n, |b, &n| {
            let o = orchestrator(&rt);
            b.iter(|| {
                let t = Instant::now();
                o.ingest_frame(detections_for(n, t), t);
                rt.block_on(o.dispatch_ready(t + Duration::from_secs(60)));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dispatch_cycle);
criterion_main!(benches);

//! Spatial grouper benchmark: measures `cluster_detections` cost as
//! detection count per frame grows.

use std::time::Instant;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use visifruit_common::types::{BBoxPx, FruitClass};
use visifruit_core::grouper::cluster_detections;
use visifruit_core::test_support::sample_calibration;

fn detections_for(n: usize) -> Vec<visifruit_common::types::RawDetection> {
    let now = Instant::now();
    (0..n)
        .map(|i| {
            let row = (i / 8) as f64;
            let col = (i % 8) as f64;
            let x1 = col * 150.0 + 10.0;
            let y1 = row * 200.0 + 10.0;
            visifruit_common::types::RawDetection {
                class: match i % 3 {
                    0 => FruitClass::Apple,
                    1 => FruitClass::Pear,
                    _ => FruitClass::Lemon,
                },
                confidence: 0.9,
                bbox_px: BBoxPx { x1, y1, x2: x1 + 40.0, y2: y1 + 40.0 },
                frame_time: now,
            }
        })
        .collect()
}

fn bench_cluster(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster_detections");
    group.significance_level(0.01);
    group.sample_size(200);

    let cal = sample_calibration();
    for &n in &[1usize, 8, 32, 64, 128] {
        let detections = detections_for(n);
        group.bench_with_input(BenchmarkId::new("detections", n), &n, |b, _| {
            b.iter(|| cluster_detections(detections.clone(), &cal));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cluster);
criterion_main!(benches);

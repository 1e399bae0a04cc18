//! Pixel→world projection and the spatial grouper (§4.F, and the
//! projection half of §4.G). Grounded directly on
//! `original_source/IA_Etiquetado/smart_position_detector.py`'s
//! `SmartPositionDetector`: DBSCAN over `(x_m, y_m)`, grid-snap
//! row/column assignment, and density/predominant-class derivation.

use std::collections::HashMap;

use visifruit_common::calibration::Calibration;
use visifruit_common::consts::{GRID_SNAP_TOLERANCE_M, MIN_CLUSTER_AREA_M2, MIN_CLUSTER_PAD_M};
use visifruit_common::types::{Cluster, FruitClass, FruitPosition, RawDetection};

/// Pixel→world projection (§3, §4.G): bbox center and size divided by
/// the per-axis pixel scale, offset by the camera origin. Grid
/// assignment (`row`/`col`) is filled in later by [`cluster_detections`].
pub fn project(detection: RawDetection, cal: &Calibration) -> FruitPosition {
    let (cx_px, cy_px) = detection.bbox_px.center();
    let center_x_m = cal.camera_origin_x_m + cx_px / cal.pixels_per_meter_x;
    let center_y_m = cal.camera_origin_y_m + cy_px / cal.pixels_per_meter_y;
    let width_m = detection.bbox_px.width() / cal.pixels_per_meter_x;
    let length_m = detection.bbox_px.height() / cal.pixels_per_meter_y;
    FruitPosition {
        detection,
        center_x_m,
        center_y_m,
        width_m,
        length_m,
        cluster_id: None,
        row: None,
        col: None,
    }
}

fn euclidean(a: &FruitPosition, b: &FruitPosition) -> f64 {
    let dx = a.center_x_m - b.center_x_m;
    let dy = a.center_y_m - b.center_y_m;
    (dx * dx + dy * dy).sqrt()
}

fn region_query(points: &[FruitPosition], i: usize, eps: f64) -> Vec<usize> {
    (0..points.len())
        .filter(|&j| j != i && euclidean(&points[i], &points[j]) <= eps)
        .collect()
}

/// DBSCAN over `(x_m, y_m)` with `eps = cluster_eps_m` and
/// `min_samples = cluster_min_samples` (§4.F). Inputs are sorted by
/// `(frame_time, y_m, x_m)` first so identical inputs yield identical
/// `cluster_id`s (§4.F "Determinism").
fn dbscan(mut points: Vec<FruitPosition>, eps: f64, min_samples: usize) -> Vec<Vec<FruitPosition>> {
    points.sort_by(|a, b| {
        a.detection
            .frame_time
            .cmp(&b.detection.frame_time)
            .then_with(|| a.center_y_m.partial_cmp(&b.center_y_m).unwrap())
            .then_with(|| a.center_x_m.partial_cmp(&b.center_x_m).unwrap())
    });

    let n = points.len();
    let mut visited = vec![false; n];
    let mut assigned = vec![false; n];
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        let neighbors = region_query(&points, i, eps);
        // min_samples counts the point itself as a core-point candidate.
        let mut members = vec![i];
        assigned[i] = true;
        let mut seeds = neighbors;
        let mut idx = 0;
        while idx < seeds.len() {
            let q = seeds[idx];
            idx += 1;
            if !visited[q] {
                visited[q] = true;
                let q_neighbors = region_query(&points, q, eps);
                if q_neighbors.len() + 1 >= min_samples {
                    for nb in q_neighbors {
                        if !seeds.contains(&nb) {
                            seeds.push(nb);
                        }
                    }
                }
            }
            if !assigned[q] {
                assigned[q] = true;
                members.push(q);
            }
        }
        groups.push(members);
    }

    let mut slots: Vec<Option<FruitPosition>> = points.into_iter().map(Some).collect();
    groups
        .into_iter()
        .map(|idxs| idxs.into_iter().map(|i| slots[i].take().unwrap()).collect())
        .collect()
}

/// Greedily buckets sorted values into 1-D groups within `tolerance`
/// of the group's first member, returning each input's bucket index
/// (§4.F "snap positions into a grid").
fn grid_snap_indices(values: &[f64], tolerance: f64) -> Vec<u32> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap());

    let mut indices = vec![0u32; values.len()];
    let mut current_bucket = 0u32;
    let mut bucket_start = values[order[0]];
    indices[order[0]] = 0;
    for &i in &order[1..] {
        if values[i] - bucket_start > tolerance {
            current_bucket += 1;
            bucket_start = values[i];
        }
        indices[i] = current_bucket;
    }
    indices
}

fn predominant_class(members: &[FruitPosition]) -> FruitClass {
    let mut totals: HashMap<FruitClass, (usize, f64)> = HashMap::new();
    for m in members {
        let entry = totals.entry(m.class()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += m.detection.confidence;
    }
    totals
        .into_iter()
        .map(|(class, (count, confidence_sum))| (count, confidence_sum / count as f64, class))
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.total_cmp(&b.1)))
        .map(|(_, _, class)| class)
        .unwrap_or(FruitClass::Unknown)
}

/// Turns a frame's raw detections into clusters (§4.F). Projection
/// (pixel→world) happens first, then DBSCAN, then the per-cluster
/// derived fields: extent (with minimum pad), grid assignment,
/// density, and predominant class.
pub fn cluster_detections(detections: Vec<RawDetection>, cal: &Calibration) -> Vec<Cluster> {
    let positions: Vec<FruitPosition> = detections.into_iter().map(|d| project(d, cal)).collect();
    let groups = dbscan(positions, cal.cluster_eps_m, cal.cluster_min_samples as usize);

    groups
        .into_iter()
        .enumerate()
        .map(|(cluster_id, mut members)| {
            let cluster_id = cluster_id as u64;

            let xs: Vec<f64> = members.iter().map(|m| m.center_x_m).collect();
            let ys: Vec<f64> = members.iter().map(|m| m.center_y_m).collect();
            let min_x = xs.iter().cloned().fold(f64::INFINITY, f64::min);
            let max_x = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let min_y = ys.iter().cloned().fold(f64::INFINITY, f64::min);
            let max_y = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

            let width_m = (max_x - min_x).max(MIN_CLUSTER_PAD_M);
            let length_m = (max_y - min_y).max(MIN_CLUSTER_PAD_M);
            let center_m = ((min_x + max_x) / 2.0, (min_y + max_y) / 2.0);

            let row_indices = grid_snap_indices(&ys, GRID_SNAP_TOLERANCE_M);
            let col_indices = grid_snap_indices(&xs, GRID_SNAP_TOLERANCE_M);
            let rows = row_indices.iter().max().map(|m| m + 1).unwrap_or(1);
            let cols = col_indices.iter().max().map(|m| m + 1).unwrap_or(1);
            for (member, (row, col)) in members.iter_mut().zip(row_indices.into_iter().zip(col_indices)) {
                member.cluster_id = Some(cluster_id);
                member.row = Some(row);
                member.col = Some(col);
            }

            let area = (width_m * length_m).max(MIN_CLUSTER_AREA_M2);
            let density = members.len() as f64 / area;
            let predominant_class = predominant_class(&members);

            Cluster {
                cluster_id,
                members,
                center_m,
                extent_m: (width_m, length_m),
                rows,
                cols,
                density,
                predominant_class,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use visifruit_common::types::BBoxPx;

    fn detection(class: FruitClass, x_px: f64, y_px: f64, confidence: f64, t: Instant) -> RawDetection {
        RawDetection {
            class,
            confidence,
            bbox_px: BBoxPx { x1: x_px - 5.0, y1: y_px - 5.0, x2: x_px + 5.0, y2: y_px + 5.0 },
            frame_time: t,
        }
    }

    fn calibration() -> Calibration {
        crate::test_support::sample_calibration()
    }

    #[test]
    fn every_cluster_is_non_empty_with_positive_extent() {
        let cal = calibration();
        let t = Instant::now();
        let detections = vec![detection(FruitClass::Apple, 256.0, 1024.0, 0.9, t)];
        let clusters = cluster_detections(detections, &cal);
        assert_eq!(clusters.len(), 1);
        let c = &clusters[0];
        assert!(c.size() >= 1);
        assert!(c.extent_m.0 > 0.0 && c.extent_m.1 > 0.0);
        assert!(c.rows * c.cols >= c.size() as u32);
    }

    #[test]
    fn tight_eps_groups_nearby_apples_into_one_cluster() {
        let mut cal = calibration();
        cal.cluster_eps_m = 0.08;
        let t = Instant::now();
        // 3cm apart in y (pixel scale 2560 px/m => 0.03m = 76.8px).
        let detections = vec![
            detection(FruitClass::Apple, 256.0, 1024.0, 0.9, t),
            detection(FruitClass::Apple, 256.0, 1101.0, 0.9, t),
            detection(FruitClass::Apple, 256.0, 1178.0, 0.9, t),
        ];
        let clusters = cluster_detections(detections, &cal);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].size(), 3);
        assert_eq!(clusters[0].rows, 3);
        assert_eq!(clusters[0].cols, 1);
    }

    #[test]
    fn tiny_eps_splits_the_same_apples_into_three_clusters() {
        let mut cal = calibration();
        cal.cluster_eps_m = 0.02;
        let t = Instant::now();
        let detections = vec![
            detection(FruitClass::Apple, 256.0, 1024.0, 0.9, t),
            detection(FruitClass::Apple, 256.0, 1101.0, 0.9, t),
            detection(FruitClass::Apple, 256.0, 1178.0, 0.9, t),
        ];
        let clusters = cluster_detections(detections, &cal);
        assert_eq!(clusters.len(), 3);
    }

    #[test]
    fn clustering_is_deterministic_across_runs() {
        let cal = calibration();
        let t = Instant::now();
        let make = || {
            vec![
                detection(FruitClass::Apple, 500.0, 900.0, 0.9, t),
                detection(FruitClass::Pear, 100.0, 300.0, 0.8, t),
                detection(FruitClass::Apple, 520.0, 910.0, 0.95, t),
            ]
        };
        let a = cluster_detections(make(), &cal);
        let b = cluster_detections(make(), &cal);
        let ids_a: Vec<u64> = a.iter().map(|c| c.cluster_id).collect();
        let ids_b: Vec<u64> = b.iter().map(|c| c.cluster_id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn predominant_class_breaks_ties_by_confidence() {
        let members = vec![
            FruitPosition {
                detection: detection(FruitClass::Apple, 0.0, 0.0, 0.5, Instant::now()),
                center_x_m: 0.0,
                center_y_m: 0.0,
                width_m: 0.05,
                length_m: 0.05,
                cluster_id: None,
                row: None,
                col: None,
            },
            FruitPosition {
                detection: detection(FruitClass::Pear, 0.0, 0.0, 0.9, Instant::now()),
                center_x_m: 0.0,
                center_y_m: 0.0,
                width_m: 0.05,
                length_m: 0.05,
                cluster_id: None,
                row: None,
                col: None,
            },
        ];
        assert_eq!(predominant_class(&members), FruitClass::Pear);
    }
}

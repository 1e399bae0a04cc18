//! Detection deduplication (§4.H): a bounded ring of recently accepted
//! detections, used to suppress the same physical fruit observed
//! across multiple frames. Grounded on
//! `original_source/IA_Etiquetado/smart_position_detector.py`'s
//! 100-entry detection history. A plain `VecDeque` capped at
//! `MAX_DEDUP_RING` is enough since the ring is owned by a single
//! cooperative task, never shared (§5); the fixed-capacity `heapless`
//! collections used elsewhere in the workspace are for data crossing
//! task/thread boundaries, which this isn't.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use visifruit_common::calibration::DedupConfig;
use visifruit_common::consts::MAX_DEDUP_RING;
use visifruit_common::types::{BBoxPx, FruitClass, RawDetection};

#[derive(Debug, Clone)]
struct Entry {
    class: FruitClass,
    bbox: BBoxPx,
    frame_time: Instant,
}

/// Per-frame/rolling dedup counters, read by diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DedupStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub over_cap: u64,
}

/// The bounded ring plus per-frame cap enforcement (§4.H).
pub struct Deduplicator {
    ring: VecDeque<Entry>,
    stats: DedupStats,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(MAX_DEDUP_RING),
            stats: DedupStats::default(),
        }
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    fn is_duplicate(&self, detection: &RawDetection, cfg: &DedupConfig) -> bool {
        let window = Duration::from_secs_f64(cfg.window_s);
        self.ring.iter().any(|prior| {
            prior.class == detection.class
                && detection
                    .frame_time
                    .saturating_duration_since(prior.frame_time)
                    <= window
                && (detection.bbox_px.iou(&prior.bbox) >= cfg.iou_threshold
                    || center_distance_px(&detection.bbox_px, &prior.bbox) <= cfg.center_distance_px)
        })
    }

    /// Applies §4.H to one frame's detections: duplicates are dropped
    /// (and counted), then the remainder is capped at
    /// `dedup.max_per_frame`. Accepted detections are pushed onto the
    /// ring, evicting the oldest entry once `MAX_DEDUP_RING` is
    /// reached even if `dedup.window_s` configures a larger window.
    pub fn filter_frame(&mut self, detections: Vec<RawDetection>, cfg: &DedupConfig) -> Vec<RawDetection> {
        self.prune_stale(cfg);

        let mut accepted = Vec::with_capacity(detections.len());
        for detection in detections {
            if self.is_duplicate(&detection, cfg) {
                self.stats.duplicates += 1;
                continue;
            }
            if accepted.len() as u32 >= cfg.max_per_frame {
                self.stats.over_cap += 1;
                continue;
            }
            self.push(&detection);
            self.stats.accepted += 1;
            accepted.push(detection);
        }
        accepted
    }

    fn push(&mut self, detection: &RawDetection) {
        if self.ring.len() >= MAX_DEDUP_RING {
            self.ring.pop_front();
        }
        self.ring.push_back(Entry {
            class: detection.class,
            bbox: detection.bbox_px,
            frame_time: detection.frame_time,
        });
    }

    fn prune_stale(&mut self, cfg: &DedupConfig) {
        let Some(newest) = self.ring.back().map(|e| e.frame_time) else {
            return;
        };
        let window = Duration::from_secs_f64(cfg.window_s);
        while let Some(front) = self.ring.front() {
            if newest.saturating_duration_since(front.frame_time) > window {
                self.ring.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

fn center_distance_px(a: &BBoxPx, b: &BBoxPx) -> f64 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
}

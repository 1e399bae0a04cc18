//! The data model of §3: detections, positions, clusters, commands,
//! belt state, and per-actuator health. These types carry no behavior
//! beyond small derived accessors; the operations that produce and
//! consume them live in `visifruit_core`.

use std::time::{Duration, Instant};

/// Fruit classification. `Unknown` never produces a diverter command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FruitClass {
    Apple,
    Pear,
    Lemon,
    Unknown,
}

impl FruitClass {
    pub const CONCRETE: [FruitClass; 3] = [FruitClass::Apple, FruitClass::Pear, FruitClass::Lemon];

    pub fn is_unknown(self) -> bool {
        matches!(self, FruitClass::Unknown)
    }
}

/// Axis-aligned pixel bounding box, `(x1, y1, x2, y2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBoxPx {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBoxPx {
    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Intersection-over-union with another box; 0.0 for disjoint
    /// boxes.
    pub fn iou(&self, other: &BBoxPx) -> f64 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let iw = (ix2 - ix1).max(0.0);
        let ih = (iy2 - iy1).max(0.0);
        let intersection = iw * ih;
        if intersection <= 0.0 {
            return 0.0;
        }
        let area_self = self.width() * self.height();
        let area_other = other.width() * other.height();
        let union = area_self + area_other - intersection;
        if union <= 0.0 { 0.0 } else { intersection / union }
    }
}

/// A single per-frame classification result from the external
/// detector. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class: FruitClass,
    pub confidence: f64,
    pub bbox_px: BBoxPx,
    pub frame_time: Instant,
}

/// A [`RawDetection`] augmented with world coordinates and a grid
/// assignment, produced by the timing model's pixel→world projection.
#[derive(Debug, Clone, PartialEq)]
pub struct FruitPosition {
    pub detection: RawDetection,
    pub center_x_m: f64,
    pub center_y_m: f64,
    pub width_m: f64,
    pub length_m: f64,
    pub cluster_id: Option<u64>,
    pub row: Option<u32>,
    pub col: Option<u32>,
}

impl FruitPosition {
    pub fn class(&self) -> FruitClass {
        self.detection.class
    }
}

/// An ordered, non-empty set of [`FruitPosition`] sharing a
/// `cluster_id`, with the derived fields the grouper computes.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub cluster_id: u64,
    pub members: Vec<FruitPosition>,
    pub center_m: (f64, f64),
    pub extent_m: (f64, f64),
    pub rows: u32,
    pub cols: u32,
    pub density: f64,
    pub predominant_class: FruitClass,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// What an [`ActivationCommand`] is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActuatorTarget {
    Labeler,
    Diverter(FruitClass),
}

impl std::fmt::Display for ActuatorTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActuatorTarget::Labeler => write!(f, "labeler"),
            ActuatorTarget::Diverter(class) => write!(f, "diverter[{class:?}]"),
        }
    }
}

/// A scheduled, future activation of one actuator. `fire_at ≥ now` at
/// emission; `duration > 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationCommand {
    pub target: ActuatorTarget,
    pub fire_at: Instant,
    pub duration: Duration,
    pub intensity: f64,
    pub origin_cluster_id: u64,
}

impl ActivationCommand {
    /// The absolute instant beyond which this command is dropped even
    /// if the driver is free (§4.I timeouts).
    pub fn expires_at(&self, slack: Duration) -> Instant {
        self.fire_at + self.duration + slack
    }

    /// Whether this command's activation window overlaps another's on
    /// the same actuator (§4.I "Overlap").
    pub fn overlaps(&self, other: &ActivationCommand) -> bool {
        let (a_start, a_end) = (self.fire_at, self.fire_at + self.duration);
        let (b_start, b_end) = (other.fire_at, other.fire_at + other.duration);
        a_start < b_end && b_start < a_end
    }
}

/// Belt direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// The belt's process-wide state. Terminal only via explicit reset
/// from `Emergency`/`Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum BeltState {
    Idle,
    Starting,
    Running(Direction),
    Stopping,
    Emergency,
    Error(String),
}

/// Per-actuator health counters. Mutated only by the owning driver
/// task; readers receive copies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorHealth {
    pub activations: u64,
    pub errors: u64,
    pub missed_deadlines: u64,
    pub total_active_time: Duration,
    pub last_fault: Option<LastFault>,
    pub wear_score: f64,
}

/// A compact record of the most recent fault, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastFault {
    pub at: Instant,
    pub persistent: bool,
}

impl Default for ActuatorHealth {
    fn default() -> Self {
        Self {
            activations: 0,
            errors: 0,
            missed_deadlines: 0,
            total_active_time: Duration::ZERO,
            last_fault: None,
            wear_score: 1.0,
        }
    }
}

impl ActuatorHealth {
    /// Rolling health decay/recovery grounded in the source machine's
    /// `ActuatorMetrics`: each recorded error decays the score, each
    /// successful activation recovers it slowly, both bounded to
    /// `[0, 1]`.
    pub fn record_activation(&mut self, active_for: Duration) {
        self.activations += 1;
        self.total_active_time += active_for;
        self.wear_score = (self.wear_score + 0.01).min(1.0);
    }

    pub fn record_error(&mut self, at: Instant, persistent: bool) {
        self.errors += 1;
        self.last_fault = Some(LastFault { at, persistent });
        let decay = if persistent { 0.2 } else { 0.05 };
        self.wear_score = (self.wear_score - decay).max(0.0);
    }

    pub fn record_missed_deadline(&mut self) {
        self.missed_deadlines += 1;
    }
}

//! The Scheduler / Orchestrator (§4.I): the heart of the pipeline.
//! Owns the scheduled-command min-heap and drives the labeler and
//! diverter bank; the belt is driven independently but shares the
//! same emergency-stop fan-out. Shaped as a read → evaluate → act
//! pipeline, but event-driven rather than fixed-rate, since the core
//! has no hardware clock tick of its own (§5).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use visifruit_common::calibration::Calibration;
use visifruit_common::consts::MAX_DISPATCH_SLACK_MS;
use visifruit_common::error::CoreError;
use visifruit_common::types::{ActivationCommand, ActuatorTarget, FruitClass, RawDetection};

use crate::belt::BeltController;
use crate::dedup::Deduplicator;
use crate::diverter::DiverterBank;
use crate::grouper::cluster_detections;
use crate::labeler::LabelerDriver;
use crate::timing::{diverter_command, labeler_command};

#[derive(Debug, Clone)]
struct QueuedCommand(ActivationCommand);

impl PartialEq for QueuedCommand {
    fn eq(&self, other: &Self) -> bool {
        self.0.fire_at == other.0.fire_at
    }
}
impl Eq for QueuedCommand {}
impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedCommand {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest fire_at sorts first.
        other.0.fire_at.cmp(&self.0.fire_at)
    }
}

/// Per-frame/pass counters, surfaced for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub late: u64,
    pub overlap_dropped: u64,
    pub missed_deadline: u64,
    pub expired: u64,
}

/// The central loop's state (§4.I). Construction wires it to an
/// already-initialized [`LabelerDriver`], [`DiverterBank`], and
/// [`BeltController`]; the orchestrator never constructs the HAL
/// itself.
pub struct Orchestrator {
    labeler: Arc<LabelerDriver>,
    diverters: Arc<DiverterBank>,
    belt: Arc<BeltController>,
    dedup: Mutex<Deduplicator>,
    calibration: RwLock<Arc<Calibration>>,
    heap: Mutex<BinaryHeap<QueuedCommand>>,
    busy_until: Mutex<HashMap<ActuatorTarget, Instant>>,
    labeler_enabled: AtomicBool,
    diverter_enabled: Mutex<HashMap<FruitClass, bool>>,
    stats: Mutex<DispatchStats>,
    last_control_update: Mutex<u64>,
}

impl Orchestrator {
    pub fn new(
        labeler: Arc<LabelerDriver>,
        diverters: Arc<DiverterBank>,
        belt: Arc<BeltController>,
        calibration: Calibration,
    ) -> Self {
        let mut diverter_enabled = HashMap::new();
        for class in FruitClass::CONCRETE {
            diverter_enabled.insert(class, true);
        }
        Self {
            labeler,
            diverters,
            belt,
            dedup: Mutex::new(Deduplicator::new()),
            calibration: RwLock::new(Arc::new(calibration)),
            heap: Mutex::new(BinaryHeap::new()),
            busy_until: Mutex::new(HashMap::new()),
            labeler_enabled: AtomicBool::new(true),
            diverter_enabled: Mutex::new(diverter_enabled),
            stats: Mutex::new(DispatchStats::default()),
            last_control_update: Mutex::new(0),
        }
    }

    pub fn calibration(&self) -> Arc<Calibration> {
        self.calibration.read().clone()
    }

    /// Atomic snapshot swap (§4.J, §8 "any scheduling pass observes
    /// either the old snapshot fully or the new one fully").
    pub fn set_calibration(&self, new: Calibration) {
        *self.calibration.write() = Arc::new(new);
    }

    pub fn set_labeler_enabled(&self, enabled: bool) {
        self.labeler_enabled.store(enabled, AtomicOrdering::SeqCst);
    }

    pub fn set_diverter_enabled(&self, class: FruitClass, enabled: bool) {
        self.diverter_enabled.lock().insert(class, enabled);
    }

    pub fn stats(&self) -> DispatchStats {
        *self.stats.lock()
    }

    /// Applies a Control-Channel message only if `updated_at` strictly
    /// exceeds the last applied value (§4.J, §8 idempotence).
    pub fn apply_if_newer(&self, updated_at: u64, apply: impl FnOnce(&Self)) -> bool {
        let mut last = self.last_control_update.lock();
        if updated_at <= *last {
            return false;
        }
        *last = updated_at;
        drop(last);
        apply(self);
        true
    }

    /// Steps 1-5 of §4.I's per-frame pipeline: dedup, project+cluster,
    /// per-cluster timing, enqueue. Does not dispatch — call
    /// [`Self::dispatch_ready`] next.
    pub fn ingest_frame(&self, detections: Vec<RawDetection>, now: Instant) {
        let cal = self.calibration();
        let accepted = self.dedup.lock().filter_frame(detections, &cal.dedup);
        let clusters = cluster_detections(accepted, &cal);

        let mut heap = self.heap.lock();
        let mut busy = self.busy_until.lock();
        let mut stats = self.stats.lock();

        let mut pending = Vec::new();
        for cluster in &clusters {
            if self.labeler_enabled.load(AtomicOrdering::SeqCst) {
                match labeler_command(cluster, &cal, now) {
                    Ok(cmd) => pending.push(cmd),
                    Err(CoreError::Late { .. }) => stats.late += 1,
                    Err(_) => {}
                }
            }
            let class = cluster.predominant_class;
            if *self.diverter_enabled.lock().get(&class).unwrap_or(&true) {
                if let Some(result) = diverter_command(cluster, &cal, now) {
                    match result {
                        Ok(cmd) => pending.push(cmd),
                        Err(CoreError::Late { .. }) => stats.late += 1,
                        Err(_) => {}
                    }
                }
            }
        }

        // Clusters are ordered by position, not by schedule time, so a
        // farther cluster (larger fire_at) can be produced before a nearer
        // one (smaller fire_at) targeting the same actuator. `enqueue`'s
        // overlap watermark only holds against non-decreasing fire_at per
        // target, so restore that order before committing any of them.
        pending.sort_by_key(|cmd| cmd.fire_at);
        for cmd in pending {
            enqueue(&mut heap, &mut busy, &mut stats, cmd);
        }
    }

    /// Step 6: drains the heap while `head.fire_at ≤ now` and
    /// dispatches each command to its driver with a bounded wait
    /// capped at the command's remaining slack.
    pub async fn dispatch_ready(&self, now: Instant) {
        let cal = self.calibration();
        loop {
            let due = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(q) if q.0.fire_at <= now => heap.pop().map(|q| q.0),
                    _ => None,
                }
            };
            let Some(cmd) = due else { break };

            let slack = Duration::from_millis(MAX_DISPATCH_SLACK_MS);
            if now > cmd.expires_at(slack) {
                self.stats.lock().expired += 1;
                warn!(target = %cmd.target, "command expired before dispatch");
                continue;
            }

            let remaining_slack = cmd.expires_at(slack).saturating_duration_since(now);
            self.dispatch_one(cmd, &cal, remaining_slack).await;
        }
    }

    async fn dispatch_one(&self, cmd: ActivationCommand, cal: &Calibration, slack: Duration) {
        let now = Instant::now();
        let outcome = match cmd.target {
            ActuatorTarget::Labeler => {
                tokio::time::timeout(
                    slack,
                    self.labeler.activate_for(
                        cmd.duration,
                        cmd.intensity,
                        cal.labeler_max_activations_per_minute,
                        cal.labeler_max_activation_time_s,
                        now,
                    ),
                )
                .await
            }
            ActuatorTarget::Diverter(class) => {
                tokio::time::timeout(slack, async {
                    self.diverters
                        .activate(class, now)
                        .await
                        .unwrap_or(Ok(()))
                })
                .await
            }
        };

        let mut stats = self.stats.lock();
        match outcome {
            Ok(Ok(())) => {
                stats.dispatched += 1;
            }
            Ok(Err(e)) if e.is_recoverable() => {
                info!(target = %cmd.target, error = %e, "activation skipped");
            }
            Ok(Err(e)) => {
                warn!(target = %cmd.target, error = %e, "activation failed");
            }
            Err(_) => {
                stats.missed_deadline += 1;
                self.record_missed_deadline(cmd.target);
                warn!(target = %cmd.target, "missed dispatch deadline");
            }
        }
    }

    fn record_missed_deadline(&self, target: ActuatorTarget) {
        match target {
            ActuatorTarget::Labeler => self.labeler.record_missed_deadline(),
            ActuatorTarget::Diverter(class) => self.diverters.record_missed_deadline(class),
        }
    }

    /// Cancels every in-flight command, drains the heap, and forces
    /// the release path on every driver (§4.I, §8 idempotence).
    pub fn emergency_stop(&self) {
        self.heap.lock().clear();
        self.busy_until.lock().clear();
        self.labeler.emergency_stop();
        self.diverters.emergency_stop_all();
        self.belt.emergency_stop();
    }

    pub fn reset_emergency(&self) -> Result<(), CoreError> {
        self.labeler.reset_emergency()?;
        self.diverters.reset_emergency_all();
        self.belt.reset();
        Ok(())
    }
}

fn enqueue(
    heap: &mut BinaryHeap<QueuedCommand>,
    busy: &mut HashMap<ActuatorTarget, Instant>,
    stats: &mut DispatchStats,
    cmd: ActivationCommand,
) {
    if let Some(&busy_until) = busy.get(&cmd.target) {
        if cmd.fire_at < busy_until {
            stats.overlap_dropped += 1;
            warn!(target = %cmd.target, "overlapping command dropped");
            return;
        }
    }
    busy.insert(cmd.target, cmd.fire_at + cmd.duration);
    heap.push(QueuedCommand(cmd));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use visifruit_common::types::BBoxPx;
    use visifruit_hal::drivers::simulation::SimulationHal;

    fn orchestrator() -> Orchestrator {
        let hal: Arc<dyn visifruit_common::hal::driver::ActuatorHal> = Arc::new(SimulationHal::new());
        let machine = crate::config::test_support::sample_machine_config();
        let labeler = Arc::new(LabelerDriver::new(hal.clone(), machine.labeler));
        let diverters = Arc::new(DiverterBank::new(hal.clone(), &machine.diverters, 4, Duration::from_millis(5)));
        let belt = BeltController::new(hal, machine.belt, Duration::from_secs(5));
        Orchestrator::new(labeler, diverters, belt, crate::test_support::sample_calibration())
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
    async fn single_apple_enqueues_label_and_diverter_commands() {
        let o = orchestrator();
        o.labeler.init().await.unwrap();
        o.diverters.init_all().unwrap();
        let t = Instant::now();
        // center_y_m = 0.2 + 1024/2560 = 0.6, projects differently from
        // the timing-module fixture; what matters here is both commands land.
        o.ingest_frame(vec![detection(FruitClass::Apple, 256.0, 1024.0, t)], t);
        assert_eq!(o.heap.lock().len(), 2);
    }

    #[tokio::test]
    async fn dispatch_ready_drains_due_commands() {
        let o = orchestrator();
        o.labeler.init().await.unwrap();
        o.diverters.init_all().unwrap();
        let t = Instant::now();
        o.ingest_frame(vec![detection(FruitClass::Apple, 256.0, 1024.0, t)], t);
        // Both commands' fire_at are already <= now + tiny epsilon for this geometry;
        // advance "now" generously to guarantee they're due.
        let later = t + Duration::from_secs(10);
        o.dispatch_ready(later).await;
        assert_eq!(o.heap.lock().len(), 0);
        assert!(o.stats().dispatched + o.stats().late + o.stats().missed_deadline >= 1);
    }

    #[tokio::test]
    async fn emergency_stop_drains_heap_and_latches_drivers() {
        let o = orchestrator();
        o.labeler.init().await.unwrap();
        o.diverters.init_all().unwrap();
        let t = Instant::now();
        o.ingest_frame(vec![detection(FruitClass::Apple, 256.0, 1024.0, t)], t);
        o.emergency_stop();
        assert_eq!(o.heap.lock().len(), 0);
        assert_eq!(o.labeler.state(), crate::labeler::LabelerState::Emergency);
    }

    #[tokio::test]
    async fn two_spatially_separated_clusters_in_one_frame_do_not_overlap_drop() {
        let o = orchestrator();
        o.labeler.init().await.unwrap();
        o.diverters.init_all().unwrap();
        let t = Instant::now();
        // world y = 0.2 + px_y/2560: 256px -> 0.3m (far from both offsets),
        // 1024px -> 0.6m (near). Same class, same frame, so both the
        // labeler and the diverter see two commands for the same target;
        // the farther cluster's activation interval ends long before the
        // nearer one's starts, so neither should be dropped as overlapping.
        o.ingest_frame(
            vec![
                detection(FruitClass::Apple, 256.0, 256.0, t),
                detection(FruitClass::Apple, 256.0, 1024.0, t),
            ],
            t,
        );
        assert_eq!(o.stats().overlap_dropped, 0);
        assert_eq!(o.heap.lock().len(), 4);
    }

    #[test]
    fn control_channel_update_is_idempotent_by_version() {
        let o = orchestrator();
        let applied_once = o.apply_if_newer(5, |o| o.set_labeler_enabled(false));
        let applied_twice = o.apply_if_newer(5, |o| o.set_labeler_enabled(true));
        assert!(applied_once);
        assert!(!applied_twice);
        assert!(!o.labeler_enabled.load(AtomicOrdering::SeqCst));
    }
}

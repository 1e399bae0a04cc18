//! The Trigger Sensor (§4.E): edge-detected when the HAL supports it,
//! polling otherwise, with a one-shot auto-calibration pass. Edge
//! delivery is reshaped as messages per §9's "coroutine / callback
//! event handlers" redesign flag — the HAL side only enqueues onto a
//! channel the sensor task drains.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use visifruit_common::hal::driver::ActuatorHal;
use visifruit_common::hal::types::{CancelToken, Edge, EdgeEvent, Level, PinMode, Pull};

use crate::config::SensorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutoCalPhase {
    ObservingEdge,
    ObservingPull,
    Done,
}

/// One-shot boot-time auto-calibration (§4.E): if no triggers land
/// within `auto_cal_window_s` of the configured edge, invert the edge;
/// if still none, invert the pull direction. Whatever state it settles
/// on is then fixed for the remainder of the process's life.
struct AutoCal {
    phase: AutoCalPhase,
    window: Duration,
    started_at: Instant,
}

impl AutoCal {
    fn new(window: Duration, now: Instant) -> Self {
        Self { phase: AutoCalPhase::ObservingEdge, window, started_at: now }
    }

    fn is_done(&self) -> bool {
        self.phase == AutoCalPhase::Done
    }

    /// Called whenever a trigger fires during auto-cal; settles it
    /// immediately since the current edge/pull combination works.
    fn observe_trigger(&mut self) {
        self.phase = AutoCalPhase::Done;
    }

    /// Called periodically; advances the phase once the window
    /// elapses without a trigger. Returns `true` if the edge or pull
    /// should be flipped this call.
    fn tick(&mut self, now: Instant) -> bool {
        if self.is_done() || now.saturating_duration_since(self.started_at) < self.window {
            return false;
        }
        self.started_at = now;
        match self.phase {
            AutoCalPhase::ObservingEdge => {
                self.phase = AutoCalPhase::ObservingPull;
                true
            }
            AutoCalPhase::ObservingPull => {
                self.phase = AutoCalPhase::Done;
                true
            }
            AutoCalPhase::Done => false,
        }
    }
}

struct SensorState {
    edge: Edge,
    pull: Pull,
}

/// The sensor driver. `next_trigger()` yields one [`Instant`] per
/// debounced trigger, sourced either from the HAL's hardware edge
/// channel or an internal polling loop, whichever the HAL supports.
pub struct TriggerSensor {
    hal: Arc<dyn ActuatorHal>,
    config: SensorConfig,
    state: Mutex<SensorState>,
    cancel: CancelToken,
}

impl TriggerSensor {
    pub fn new(hal: Arc<dyn ActuatorHal>, config: SensorConfig) -> Self {
        Self {
            hal,
            config,
            state: Mutex::new(SensorState { edge: Edge::Rising, pull: Pull::None }),
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Configures the pin and spawns the sensor task, returning a
    /// channel of debounced trigger instants with auto-calibration
    /// already applied. The task exits when `cancel()` is called.
    pub fn start(self: Arc<Self>) -> Result<mpsc::Receiver<Instant>, visifruit_common::hal::driver::HalError> {
        let (edge, pull) = {
            let s = self.state.lock();
            (s.edge, s.pull)
        };
        self.hal.set_pin_mode(self.config.pin, PinMode::Input { pull })?;
        let raw = self.hal.on_edge(self.config.pin, edge, self.config.debounce(), self.cancel.clone());
        let (tx, rx) = mpsc::channel(32);

        match raw {
            Ok(hardware_rx) => {
                let this = self.clone();
                tokio::task::spawn_blocking(move || this.drain_hardware(hardware_rx, tx));
            }
            Err(_) => {
                let this = self.clone();
                tokio::spawn(async move { this.poll_loop(tx).await });
            }
        }
        Ok(rx)
    }

    fn drain_hardware(
        self: Arc<Self>,
        hardware_rx: std::sync::mpsc::Receiver<EdgeEvent>,
        tx: mpsc::Sender<Instant>,
    ) {
        let epoch = Instant::now();
        let mut auto_cal = AutoCal::new(Duration::from_secs_f64(self.config.auto_cal_window_s), epoch);
        while !self.cancel.is_cancelled() {
            match hardware_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => {
                    if !auto_cal.is_done() {
                        auto_cal.observe_trigger();
                        info!("sensor auto-calibration settled on first hardware trigger");
                    }
                    let at = epoch + Duration::from_millis(event.at_monotonic_ms);
                    if tx.blocking_send(at).is_err() {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if auto_cal.tick(Instant::now()) {
                        self.flip_auto_cal(&mut auto_cal);
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    async fn poll_loop(self: Arc<Self>, tx: mpsc::Sender<Instant>) {
        let mut auto_cal = AutoCal::new(Duration::from_secs_f64(self.config.auto_cal_window_s), Instant::now());
        let mut stable_level = self.hal.read(self.config.pin).unwrap_or(Level::Low);
        let mut pending_level = stable_level;
        let mut since_change = Instant::now();
        let mut reported = true;

        while !self.cancel.is_cancelled() {
            tokio::time::sleep(self.config.poll_period()).await;
            let now = Instant::now();
            let level = match self.hal.read(self.config.pin) {
                Ok(l) => l,
                Err(_) => continue,
            };
            if level != pending_level {
                pending_level = level;
                since_change = now;
                reported = false;
            } else if !reported
                && level != stable_level
                && now.saturating_duration_since(since_change) >= self.config.debounce()
            {
                let edge = self.state.lock().edge;
                reported = true;
                let from = stable_level;
                stable_level = level;
                if edge.matches(from, level) {
                    if !auto_cal.is_done() {
                        auto_cal.observe_trigger();
                    }
                    if tx.send(now).await.is_err() {
                        break;
                    }
                }
            }

            if !auto_cal.is_done() && auto_cal.tick(now) {
                self.flip_auto_cal(&mut auto_cal);
            }
        }
    }

    fn flip_auto_cal(&self, auto_cal: &mut AutoCal) {
        let mut s = self.state.lock();
        match auto_cal.phase {
            AutoCalPhase::ObservingPull => {
                s.edge = match s.edge {
                    Edge::Rising => Edge::Falling,
                    Edge::Falling => Edge::Rising,
                    Edge::Both => Edge::Both,
                };
                warn!(new_edge = ?s.edge, "sensor auto-calibration inverted active edge");
            }
            AutoCalPhase::Done => {
                s.pull = match s.pull {
                    Pull::None => Pull::Up,
                    Pull::Up => Pull::Down,
                    Pull::Down => Pull::None,
                };
                warn!(new_pull = ?s.pull, "sensor auto-calibration inverted pull direction");
            }
            AutoCalPhase::ObservingEdge => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_cal_settles_immediately_on_trigger() {
        let mut cal = AutoCal::new(Duration::from_secs(3), Instant::now());
        assert!(!cal.is_done());
        cal.observe_trigger();
        assert!(cal.is_done());
    }

    #[test]
    fn auto_cal_advances_through_both_phases_without_triggers() {
        let t0 = Instant::now();
        let mut cal = AutoCal::new(Duration::from_millis(10), t0);
        assert!(!cal.tick(t0));
        let t1 = t0 + Duration::from_millis(20);
        assert!(cal.tick(t1));
        assert_eq!(cal.phase, AutoCalPhase::ObservingPull);
        let t2 = t1 + Duration::from_millis(20);
        assert!(cal.tick(t2));
        assert_eq!(cal.phase, AutoCalPhase::Done);
        assert!(!cal.tick(t2 + Duration::from_secs(1)));
    }
}

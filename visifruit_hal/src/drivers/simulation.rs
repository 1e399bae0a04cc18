//! In-memory `ActuatorHal` backend. Never blocks on external voltage
//! (§4.A); used for development, CI, and any machine instantiated
//! without real hardware attached.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use visifruit_common::hal::{
    ActuatorHal, CancelToken, Edge, EdgeEvent, HalError, Level, PinId, PinMode, PulseTrainHandle,
};

#[derive(Debug, Clone, Copy)]
struct PinState {
    mode: PinMode,
    level: Level,
    pwm: Option<(f64, f64)>, // (freq_hz, duty)
}

/// Software simulation of the actuator HAL. All pin state lives in a
/// `Mutex`-guarded map; edges are observed by comparing the level
/// passed to `write` against the previous one, exactly as a polling
/// loop would against real hardware.
pub struct SimulationHal {
    pins: Arc<Mutex<HashMap<PinId, PinState>>>,
    epoch: Instant,
}

impl SimulationHal {
    pub fn new() -> Self {
        Self {
            pins: Arc::new(Mutex::new(HashMap::new())),
            epoch: Instant::now(),
        }
    }

    fn pin_state(&self, pin: PinId) -> Result<PinState, HalError> {
        self.pins
            .lock()
            .unwrap()
            .get(&pin)
            .copied()
            .ok_or(HalError::HardwareFault {
                pin,
                reason: "pin not configured".into(),
            })
    }
}

impl Default for SimulationHal {
    fn default() -> Self {
        Self::new()
    }
}

impl ActuatorHal for SimulationHal {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn set_pin_mode(&self, pin: PinId, mode: PinMode) -> Result<(), HalError> {
        let mut pins = self.pins.lock().unwrap();
        if pins.contains_key(&pin) {
            return Err(HalError::PinBusy(pin));
        }
        let level = match mode {
            PinMode::Output { initial } => initial,
            PinMode::Input { .. } => Level::Low,
        };
        pins.insert(
            pin,
            PinState {
                mode,
                level,
                pwm: None,
            },
        );
        Ok(())
    }

    fn write(&self, pin: PinId, level: Level) -> Result<(), HalError> {
        let mut pins = self.pins.lock().unwrap();
        let state = pins.get_mut(&pin).ok_or(HalError::HardwareFault {
            pin,
            reason: "pin not configured".into(),
        })?;
        state.level = level;
        Ok(())
    }

    fn read(&self, pin: PinId) -> Result<Level, HalError> {
        Ok(self.pin_state(pin)?.level)
    }

    fn pwm_start(&self, pin: PinId, freq_hz: f64, duty: f64) -> Result<(), HalError> {
        if !(0.0..=1.0).contains(&duty) {
            return Err(HalError::OutOfRange {
                field: "duty",
                reason: format!("must be in [0,1], got {duty}"),
            });
        }
        if freq_hz <= 0.0 {
            return Err(HalError::OutOfRange {
                field: "freq_hz",
                reason: format!("must be > 0, got {freq_hz}"),
            });
        }
        let mut pins = self.pins.lock().unwrap();
        let state = pins.get_mut(&pin).ok_or(HalError::HardwareFault {
            pin,
            reason: "pin not configured".into(),
        })?;
        state.pwm = Some((freq_hz, duty));
        Ok(())
    }

    fn pwm_set_duty(&self, pin: PinId, duty: f64) -> Result<(), HalError> {
        if !(0.0..=1.0).contains(&duty) {
            return Err(HalError::OutOfRange {
                field: "duty",
                reason: format!("must be in [0,1], got {duty}"),
            });
        }
        let mut pins = self.pins.lock().unwrap();
        let state = pins.get_mut(&pin).ok_or(HalError::HardwareFault {
            pin,
            reason: "pin not configured".into(),
        })?;
        let freq = state.pwm.map(|(f, _)| f).unwrap_or(0.0);
        state.pwm = Some((freq, duty));
        Ok(())
    }

    fn pwm_stop(&self, pin: PinId) -> Result<(), HalError> {
        let mut pins = self.pins.lock().unwrap();
        let state = pins.get_mut(&pin).ok_or(HalError::HardwareFault {
            pin,
            reason: "pin not configured".into(),
        })?;
        state.pwm = None;
        Ok(())
    }

    fn pulse_train(
        &self,
        _pin: PinId,
        pulses: u32,
        period_us: u32,
        _pulse_width_us: u32,
        cancel: CancelToken,
    ) -> Result<PulseTrainHandle, HalError> {
        let join = std::thread::spawn(move || {
            let mut emitted = 0u32;
            for _ in 0..pulses {
                if cancel.is_cancelled() {
                    break;
                }
                std::thread::sleep(Duration::from_micros(period_us as u64));
                emitted += 1;
            }
            emitted
        });
        Ok(PulseTrainHandle::new(join))
    }

    fn on_edge(
        &self,
        pin: PinId,
        edge: Edge,
        debounce: Duration,
        cancel: CancelToken,
    ) -> Result<Receiver<EdgeEvent>, HalError> {
        let (tx, rx) = sync_channel(64);
        let pins = Arc::clone(&self.pins);
        let epoch = self.epoch;
        std::thread::spawn(move || {
            let mut last = pins
                .lock()
                .unwrap()
                .get(&pin)
                .map(|s| s.level)
                .unwrap_or(Level::Low);
            let mut pending_since: Option<(Level, Instant)> = None;
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
                let current = match pins.lock().unwrap().get(&pin) {
                    Some(s) => s.level,
                    None => break,
                };
                if current != last {
                    pending_since = Some((current, Instant::now()));
                }
                if let Some((level, since)) = pending_since {
                    if level == current && since.elapsed() >= debounce {
                        if edge.matches(last, current) {
                            let event = EdgeEvent::new(pin, edge, Instant::now(), epoch);
                            if tx.try_send(event).is_err() {
                                // receiver lagging; drop the event, not the thread.
                            }
                        }
                        last = current;
                        pending_since = None;
                    }
                }
            }
        });
        Ok(rx)
    }
}

pub fn create_driver() -> Box<dyn ActuatorHal> {
    Box::new(SimulationHal::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let hal = SimulationHal::new();
        let pin = PinId(4);
        hal.set_pin_mode(pin, PinMode::Output { initial: Level::Low })
            .unwrap();
        hal.write(pin, Level::High).unwrap();
        assert_eq!(hal.read(pin).unwrap(), Level::High);
    }

    #[test]
    fn double_claim_is_pin_busy() {
        let hal = SimulationHal::new();
        let pin = PinId(4);
        hal.set_pin_mode(pin, PinMode::Output { initial: Level::Low })
            .unwrap();
        let err = hal
            .set_pin_mode(pin, PinMode::Output { initial: Level::Low })
            .unwrap_err();
        assert!(matches!(err, HalError::PinBusy(_)));
    }

    #[test]
    fn pwm_duty_out_of_range_rejected() {
        let hal = SimulationHal::new();
        let pin = PinId(4);
        hal.set_pin_mode(pin, PinMode::Output { initial: Level::Low })
            .unwrap();
        assert!(hal.pwm_start(pin, 50.0, 1.5).is_err());
    }

    #[test]
    fn pulse_train_reports_emitted_count() {
        let hal = SimulationHal::new();
        let pin = PinId(4);
        hal.set_pin_mode(pin, PinMode::Output { initial: Level::Low })
            .unwrap();
        let handle = hal
            .pulse_train(pin, 5, 100, 50, CancelToken::new())
            .unwrap();
        assert_eq!(handle.join(), 5);
    }

    #[test]
    fn pulse_train_cancellation_stops_early() {
        let hal = SimulationHal::new();
        let pin = PinId(4);
        hal.set_pin_mode(pin, PinMode::Output { initial: Level::Low })
            .unwrap();
        let cancel = CancelToken::new();
        let cancel_clone = cancel.clone();
        let handle = hal.pulse_train(pin, 1000, 2000, 50, cancel).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        cancel_clone.cancel();
        let emitted = handle.join();
        assert!(emitted < 1000);
    }

    #[test]
    fn on_edge_detects_a_rising_transition() {
        let hal = SimulationHal::new();
        let pin = PinId(7);
        hal.set_pin_mode(pin, PinMode::Output { initial: Level::Low })
            .unwrap();
        let cancel = CancelToken::new();
        let rx = hal
            .on_edge(pin, Edge::Rising, Duration::from_millis(5), cancel.clone())
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        hal.write(pin, Level::High).unwrap();
        let event = rx.recv_timeout(Duration::from_millis(200)).unwrap();
        assert_eq!(event.pin, pin);
        cancel.cancel();
    }
}

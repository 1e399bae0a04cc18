//! Legacy Raspberry Pi (BCM2835-family) backend: direct `/dev/gpiomem`
//! register mmap, the way pre-Pi5 boards were driven before the kernel
//! GPIO character device existed. Grounded the same way as
//! [`super::pi5`]: `nix::sys::mman` for the raw POSIX mmap, no
//! dedicated GPIO crate pulled in for a handful of register pokes.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;
use std::sync::mpsc::{Receiver, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::mman::{MapFlags, ProtFlags, mmap};
use visifruit_common::hal::{
    ActuatorHal, CancelToken, Edge, EdgeEvent, HalError, Level, PinId, PinMode, PulseTrainHandle,
};

const BLOCK_SIZE: usize = 4096;

/// BCM2835 GPIO register block, memory-mapped from `/dev/gpiomem`.
/// `GPFSEL0..5` select function, `GPSET0/1` set high, `GPCLR0/1` clear,
/// `GPLEV0/1` read level — the same four register groups every
/// BCM2835-family driver pokes.
struct RegisterBlock {
    base: NonNull<u32>,
}

// SAFETY: the mapped region is a fixed-size MMIO block; concurrent
// access is serialized by the `Mutex` around `LegacyPiHal::pins`.
unsafe impl Send for RegisterBlock {}
unsafe impl Sync for RegisterBlock {}

impl RegisterBlock {
    fn reg(&self, word_offset: usize) -> *mut u32 {
        unsafe { self.base.as_ptr().add(word_offset) }
    }

    fn set_function_output(&self, pin: u32) {
        let reg = (pin / 10) as usize;
        let shift = (pin % 10) * 3;
        unsafe {
            let ptr = self.reg(reg);
            let mut value = ptr.read_volatile();
            value &= !(0b111 << shift);
            value |= 0b001 << shift; // output
            ptr.write_volatile(value);
        }
    }

    fn set_function_input(&self, pin: u32) {
        let reg = (pin / 10) as usize;
        let shift = (pin % 10) * 3;
        unsafe {
            let ptr = self.reg(reg);
            let mut value = ptr.read_volatile();
            value &= !(0b111 << shift);
            ptr.write_volatile(value);
        }
    }

    fn write_level(&self, pin: u32, level: Level) {
        let (reg_base, bit) = (pin / 32, pin % 32);
        let reg = if level == Level::High { 7 } else { 10 } + reg_base as usize;
        unsafe {
            self.reg(reg).write_volatile(1 << bit);
        }
    }

    fn read_level(&self, pin: u32) -> Level {
        let (reg_base, bit) = (pin / 32, pin % 32);
        let value = unsafe { self.reg(13 + reg_base as usize).read_volatile() };
        if value & (1 << bit) != 0 {
            Level::High
        } else {
            Level::Low
        }
    }
}

struct PinState {
    mode: PinMode,
    pwm: Option<(f64, f64)>,
}

/// BCM2835-family mmap register driver.
pub struct LegacyPiHal {
    regs: RegisterBlock,
    pins: Arc<Mutex<std::collections::HashMap<PinId, PinState>>>,
    epoch: Instant,
}

impl LegacyPiHal {
    pub fn open() -> Result<Self, HalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/gpiomem")
            .map_err(|e| HalError::HardwareFault {
                pin: PinId(0),
                reason: format!("opening /dev/gpiomem: {e}"),
            })?;
        let mapped = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(BLOCK_SIZE).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0, // /dev/gpiomem is pre-offset by the kernel to the GPIO register block
            )
        }
        .map_err(|errno| HalError::HardwareFault {
            pin: PinId(0),
            reason: format!("mmap /dev/gpiomem failed: {errno}"),
        })?;
        let _ = file.as_raw_fd();
        Ok(Self {
            regs: RegisterBlock {
                base: mapped.cast::<u32>(),
            },
            pins: Arc::new(Mutex::new(std::collections::HashMap::new())),
            epoch: Instant::now(),
        })
    }
}

impl ActuatorHal for LegacyPiHal {
    fn name(&self) -> &'static str {
        "legacy-pi"
    }

    fn set_pin_mode(&self, pin: PinId, mode: PinMode) -> Result<(), HalError> {
        let mut pins = self.pins.lock().unwrap();
        if pins.contains_key(&pin) {
            return Err(HalError::PinBusy(pin));
        }
        match mode {
            PinMode::Output { initial } => {
                self.regs.set_function_output(pin.0);
                self.regs.write_level(pin.0, initial);
            }
            PinMode::Input { .. } => self.regs.set_function_input(pin.0),
        }
        pins.insert(pin, PinState { mode, pwm: None });
        Ok(())
    }

    fn write(&self, pin: PinId, level: Level) -> Result<(), HalError> {
        let pins = self.pins.lock().unwrap();
        if !pins.contains_key(&pin) {
            return Err(HalError::HardwareFault {
                pin,
                reason: "pin not configured".into(),
            });
        }
        self.regs.write_level(pin.0, level);
        Ok(())
    }

    fn read(&self, pin: PinId) -> Result<Level, HalError> {
        if !self.pins.lock().unwrap().contains_key(&pin) {
            return Err(HalError::HardwareFault {
                pin,
                reason: "pin not configured".into(),
            });
        }
        Ok(self.regs.read_level(pin.0))
    }

    fn pwm_start(&self, pin: PinId, freq_hz: f64, duty: f64) -> Result<(), HalError> {
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
        {
            let mut pins = self.pins.lock().unwrap();
            let state = pins.get_mut(&pin).ok_or(HalError::HardwareFault {
                pin,
                reason: "pin not configured".into(),
            })?;
            state.pwm = None;
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
        let pins = Arc::clone(&self.pins);
        // SAFETY: the register block outlives the thread; `Pi5Hal`/`LegacyPiHal`
        // are never dropped while a pulse train is in flight (§4.A contract).
        let regs_ptr = self.regs.base.as_ptr() as usize;
        let join = std::thread::spawn(move || {
            let regs = RegisterBlock {
                base: NonNull::new(regs_ptr as *mut u32).unwrap(),
            };
            let mut emitted = 0u32;
            for _ in 0..pulses {
                if cancel.is_cancelled() {
                    break;
                }
                if !pins.lock().unwrap().contains_key(&pin) {
                    break;
                }
                regs.write_level(pin.0, Level::High);
                std::thread::sleep(Duration::from_micros(pulse_width_us as u64));
                regs.write_level(pin.0, Level::Low);
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
        let (tx, rx) = sync_channel(64);
        let regs_ptr = self.regs.base.as_ptr() as usize;
        let pins = Arc::clone(&self.pins);
        let epoch = self.epoch;
        std::thread::spawn(move || {
            let regs = RegisterBlock {
                base: NonNull::new(regs_ptr as *mut u32).unwrap(),
            };
            let mut last = Level::Low;
            let mut pending_since: Option<(Level, Instant)> = None;
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
                if !pins.lock().unwrap().contains_key(&pin) {
                    break;
                }
                let current = regs.read_level(pin.0);
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
    Box::new(LegacyPiHal::open().expect("failed to mmap /dev/gpiomem"))
}

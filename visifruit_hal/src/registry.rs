//! Driver registry for HAL backends.
//!
//! Constructor-injected rather than global state: built once at
//! startup, populated via `register()`, and passed to whatever wires
//! the core together. No global `LazyLock` singleton registry is
//! carried here, since nothing in this workspace needs one.

use std::collections::HashMap;
use thiserror::Error;
use visifruit_common::hal::ActuatorHal;

/// Factory function producing a fresh backend instance.
pub type DriverFactory = fn() -> Box<dyn ActuatorHal>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HAL driver not found: {0}")]
    DriverNotFound(String),
}

/// Registry of available HAL backends, selected by runtime probe
/// (§4.A: "Selection is by runtime probe").
pub struct DriverRegistry {
    factories: HashMap<&'static str, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// # Panics
    /// Panics if a driver with the same name is already registered.
    pub fn register(&mut self, name: &'static str, factory: DriverFactory) {
        if self.factories.contains_key(name) {
            panic!("HAL driver '{name}' is already registered");
        }
        self.factories.insert(name, factory);
    }

    pub fn get_factory(&self, name: &str) -> Option<DriverFactory> {
        self.factories.get(name).copied()
    }

    pub fn create_driver(&self, name: &str) -> Result<Box<dyn ActuatorHal>, RegistryError> {
        let factory = self
            .get_factory(name)
            .ok_or_else(|| RegistryError::DriverNotFound(name.to_string()))?;
        Ok(factory())
    }

    pub fn list_drivers(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers every built-in backend. Call once at startup before any
/// driver is requested.
pub fn register_all_drivers(registry: &mut DriverRegistry) {
    registry.register("simulation", crate::drivers::simulation::create_driver);
    registry.register("pi5", crate::drivers::pi5::create_driver);
    registry.register("legacy-pi", crate::drivers::legacy_pi::create_driver);
}

#[cfg(test)]
mod tests {
    use super::*;
    use visifruit_common::hal::{CancelToken, Edge, HalError, Level, PinId, PinMode};

    struct TestDriver;

    impl ActuatorHal for TestDriver {
        fn name(&self) -> &'static str {
            "test"
        }
        fn set_pin_mode(&self, _pin: PinId, _mode: PinMode) -> Result<(), HalError> {
            Ok(())
        }
        fn write(&self, _pin: PinId, _level: Level) -> Result<(), HalError> {
            Ok(())
        }
        fn read(&self, _pin: PinId) -> Result<Level, HalError> {
            Ok(Level::Low)
        }
        fn pwm_start(&self, _pin: PinId, _freq_hz: f64, _duty: f64) -> Result<(), HalError> {
            Ok(())
        }
        fn pwm_set_duty(&self, _pin: PinId, _duty: f64) -> Result<(), HalError> {
            Ok(())
        }
        fn pwm_stop(&self, _pin: PinId) -> Result<(), HalError> {
            Ok(())
        }
        fn pulse_train(
            &self,
            _pin: PinId,
            pulses: u32,
            _period_us: u32,
            _pulse_width_us: u32,
            _cancel: CancelToken,
        ) -> Result<visifruit_common::hal::PulseTrainHandle, HalError> {
            let join = std::thread::spawn(move || pulses);
            Ok(visifruit_common::hal::PulseTrainHandle::new(join))
        }
        fn on_edge(
            &self,
            _pin: PinId,
            _edge: Edge,
            _debounce: std::time::Duration,
            _cancel: CancelToken,
        ) -> Result<std::sync::mpsc::Receiver<visifruit_common::hal::EdgeEvent>, HalError> {
            let (_tx, rx) = std::sync::mpsc::channel();
            Ok(rx)
        }
    }

    fn create_test_driver() -> Box<dyn ActuatorHal> {
        Box::new(TestDriver)
    }

    #[test]
    fn registry_register_and_create() {
        let mut reg = DriverRegistry::new();
        reg.register("test_driver", create_test_driver);
        let driver = reg.create_driver("test_driver").expect("should create");
        assert_eq!(driver.name(), "test");
    }

    #[test]
    fn registry_driver_not_found() {
        let reg = DriverRegistry::new();
        let result = reg.create_driver("nonexistent");
        assert!(matches!(result, Err(RegistryError::DriverNotFound(_))));
    }

    #[test]
    fn registry_list_drivers() {
        let mut reg = DriverRegistry::new();
        reg.register("alpha", create_test_driver);
        reg.register("beta", create_test_driver);
        let mut names = reg.list_drivers();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn registry_duplicate_panics() {
        let mut reg = DriverRegistry::new();
        reg.register("dup", create_test_driver);
        reg.register("dup", create_test_driver);
    }
}

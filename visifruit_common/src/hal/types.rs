//! Primitive HAL value types: pins, levels, pull/edge modes, and the
//! edge-event record delivered off a dedicated polling/interrupt
//! thread (§4.A, §4.E).

use std::time::{Duration, Instant};

/// Opaque pin identifier. Meaning (BCM GPIO number, character-device
/// line offset, simulated index) is driver-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn inverted(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input { pull: Pull },
    Output { initial: Level },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether a transition from `from` to `to` matches this edge kind.
    pub fn matches(self, from: Level, to: Level) -> bool {
        match self {
            Edge::Rising => from == Level::Low && to == Level::High,
            Edge::Falling => from == Level::High && to == Level::Low,
            Edge::Both => from != to,
        }
    }
}

/// One debounced edge observation, delivered on the bounded channel
/// returned by `HalDriver::on_edge` (§9 design note: callbacks
/// reshaped as messages, the HAL-side shim only enqueues).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub pin: PinId,
    pub edge: Edge,
    pub at_monotonic_ms: u64,
}

impl EdgeEvent {
    pub fn new(pin: PinId, edge: Edge, at: Instant, epoch: Instant) -> Self {
        Self {
            pin,
            edge,
            at_monotonic_ms: at.saturating_duration_since(epoch).as_millis() as u64,
        }
    }
}

/// Cooperative cancellation for long-running HAL operations
/// (`pulse_train`, polling loops, smooth servo sweeps) per §5: these
/// run on a dedicated OS thread and accept a cancellation token rather
/// than being killed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// How long a stable level must hold before it counts as debounced,
/// used both by hardware-assisted debounce and the polling fallback.
pub type Debounce = Duration;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_both_matches_either_direction() {
        assert!(Edge::Both.matches(Level::Low, Level::High));
        assert!(Edge::Both.matches(Level::High, Level::Low));
        assert!(!Edge::Both.matches(Level::Low, Level::Low));
    }

    #[test]
    fn edge_rising_matches_only_low_to_high() {
        assert!(Edge::Rising.matches(Level::Low, Level::High));
        assert!(!Edge::Rising.matches(Level::High, Level::Low));
    }

    #[test]
    fn cancel_token_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}

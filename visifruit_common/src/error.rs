//! Error taxonomy shared by every VisiFruit core component.
//!
//! Mirrors §7 of the design: kinds, not exception hierarchies. Every
//! component-local error enum (HAL, labeler, diverter, belt, scheduler)
//! converts into [`CoreError`] at the point where it either propagates
//! to the outer binary or is otherwise worth a single, uniform kind for
//! counting purposes.

use std::fmt;

/// Errors that invalidate a [`crate::calibration::Calibration`] at
/// construction. Always fatal; never retried.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("{field} is required and has no default")]
    MissingRequired { field: &'static str },

    #[error("{field}: {reason}")]
    Inconsistent { field: &'static str, reason: String },
}

/// The recoverable/fatal kind taxonomy of §7, shared by every driver
/// and by the orchestrator's local counters.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CoreError {
    /// Invalid Calibration at construction; fatal.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A HAL operation failed. `persistent` distinguishes a fault that
    /// has exhausted its retry budget (propagates, drives driver to
    /// `Error`) from one still being retried locally.
    #[error("hardware fault on {pin_or_actuator}: {reason}")]
    HardwareFault {
        pin_or_actuator: String,
        reason: String,
        persistent: bool,
    },

    /// Driver rejected an activation: already active, or rate-limited.
    #[error("{actuator} busy: {reason}")]
    Busy { actuator: String, reason: BusyReason },

    /// Cluster's `fire_at` was already in the past at scheduling time.
    #[error("command for {actuator} dropped: late by {by:?}")]
    Late {
        actuator: String,
        by: std::time::Duration,
    },

    /// Detection matched an entry in the dedup ring.
    #[error("duplicate detection dropped")]
    Duplicate,

    /// Second command to the same actuator overlapped the first.
    #[error("{actuator} command dropped: overlaps prior activation window")]
    Overlap { actuator: String },

    /// Every operation on a latched driver fails fast with this kind.
    #[error("{actuator} is emergency-latched")]
    EmergencyLatched { actuator: String },
}

/// Why a driver reported [`CoreError::Busy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    AlreadyActive,
    RateLimited,
    DurationExceedsMax,
}

impl fmt::Display for BusyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusyReason::AlreadyActive => write!(f, "already active"),
            BusyReason::RateLimited => write!(f, "rate limit exceeded"),
            BusyReason::DurationExceedsMax => write!(f, "duration exceeds max_activation_time"),
        }
    }
}

impl CoreError {
    /// Recoverable kinds are handled locally (counted) and never
    /// propagate to the outer binary, per the §7 propagation policy.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CoreError::Busy { .. }
            | CoreError::Late { .. }
            | CoreError::Duplicate
            | CoreError::Overlap { .. } => true,
            CoreError::HardwareFault { persistent, .. } => !persistent,
            CoreError::Config(_) | CoreError::EmergencyLatched { .. } => false,
        }
    }
}

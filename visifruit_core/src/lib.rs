//! # VisiFruit Control Core
//!
//! The detection-to-actuation control core for a conveyor-belt fruit
//! labeling and diversion line: deduplicates incoming detections,
//! clusters them spatially, projects cluster positions into
//! world-space travel times, schedules labeler/diverter activations
//! against a monotonic clock, and dispatches them to their drivers
//! within a bounded slack.
//!
//! ## Pipeline
//!
//! 1. **Dedup** ([`dedup`]) — suppress the same fruit re-observed
//!    across frames.
//! 2. **Grouping** ([`grouper`]) — DBSCAN-style spatial clustering of
//!    a frame's detections into fruit clusters.
//! 3. **Timing** ([`timing`]) — project cluster position to world
//!    space and compute fire times/durations for the labeler and
//!    diverter bank.
//! 4. **Scheduling** ([`scheduler`]) — a priority queue of scheduled
//!    commands, drained and dispatched as they come due.
//!
//! The labeler ([`labeler`]), diverter bank ([`diverter`]), belt
//! ([`belt`]), and trigger sensor ([`sensor`]) are the drivers the
//! scheduler and runtime wire against a concrete [`visifruit_hal`]
//! backend. The [`control_channel`] module applies external
//! configuration updates to a running [`scheduler::Orchestrator`].

pub mod belt;
pub mod config;
pub mod control_channel;
pub mod dedup;
pub mod diverter;
pub mod grouper;
pub mod labeler;
pub mod scheduler;
pub mod sensor;
pub mod timing;

/// Shared calibration/config fixtures, public so the workspace's
/// integration tests and benches can reuse them without duplicating
/// sample data.
pub mod test_support;

//! CARVE Motion Library
//!
//! The realtime half of the firmware: the trajectory planner and the
//! step-segment generator with its interrupt core.
//!
//! ## Pipeline
//!
//! 1. [`planner`] — a bounded ring of straight-line motion blocks whose
//!    junction velocities are continually re-optimised under per-axis
//!    acceleration and junction-deviation constraints.
//! 2. [`stepper`] — slices the head planner block into short fixed-duration
//!    segments tracing the velocity profile, then emits per-axis step
//!    pulses via a Bresenham line algorithm in the step interrupt.
//! 3. [`position`] — the authoritative machine position in steps, owned by
//!    the stepper and read across the interrupt boundary.
//!
//! ## Zero-Allocation Execution
//!
//! All ring storage is pre-allocated fixed arrays. Nothing in the segment
//! prep path or the interrupt core allocates.

#![deny(clippy::disallowed_types)]

pub mod planner;
pub mod position;
pub mod stepper;

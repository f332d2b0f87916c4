//! Authoritative machine position in steps.
//!
//! The stepper interrupt is the only writer; the protocol loop and the
//! reporter read concurrently across the interrupt boundary, so every axis
//! word is an atomic. Real-valued positions are derived, never stored.

use core::sync::atomic::{AtomicI32, Ordering};

use carve_common::consts::N_AXIS;

/// Signed step count per axis, shared across the interrupt boundary.
#[derive(Debug, Default)]
pub struct SysPosition {
    steps: [AtomicI32; N_AXIS],
}

impl SysPosition {
    pub const fn new() -> Self {
        Self {
            steps: [AtomicI32::new(0), AtomicI32::new(0), AtomicI32::new(0)],
        }
    }

    /// Current step count for one axis.
    #[inline]
    pub fn get(&self, axis: usize) -> i32 {
        self.steps[axis].load(Ordering::Relaxed)
    }

    /// Step the axis by ±1 (interrupt side).
    #[inline]
    pub fn step(&self, axis: usize, dir_negative: bool) {
        let delta = if dir_negative { -1 } else { 1 };
        self.steps[axis].fetch_add(delta, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot of all axes for reporting and resync.
    ///
    /// Axes are read one at a time; at most one step per axis of skew,
    /// which is within the reporting tolerance.
    pub fn snapshot(&self) -> [i32; N_AXIS] {
        let mut out = [0i32; N_AXIS];
        for (axis, word) in self.steps.iter().enumerate() {
            out[axis] = word.load(Ordering::Relaxed);
        }
        out
    }

    /// Overwrite all axes (homing, `G92`-style resync). Motion must be idle.
    pub fn set_all(&self, steps: &[i32; N_AXIS]) {
        for (axis, word) in self.steps.iter().enumerate() {
            word.store(steps[axis], Ordering::Relaxed);
        }
    }
}

/// Convert a step snapshot to millimetres.
pub fn steps_to_mm(steps: &[i32; N_AXIS], steps_per_mm: &[f32; N_AXIS]) -> [f32; N_AXIS] {
    let mut out = [0.0f32; N_AXIS];
    for axis in 0..N_AXIS {
        out[axis] = steps[axis] as f32 / steps_per_mm[axis];
    }
    out
}

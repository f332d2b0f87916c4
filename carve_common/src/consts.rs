//! Workspace-wide constants: axes, ring capacities, timing, overrides.
//!
//! Everything that used to be a compile-time macro in classic step firmwares
//! lives here as a `const`, so the rest of the workspace stays free of magic
//! numbers.

/// Number of Cartesian axes in this build (X, Y, Z).
pub const N_AXIS: usize = 3;

/// Axis array indices.
pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;

/// One-bit-per-axis masks, matching the array indices.
pub const X_AXIS_BIT: u8 = 1 << X_AXIS;
pub const Y_AXIS_BIT: u8 = 1 << Y_AXIS;
pub const Z_AXIS_BIT: u8 = 1 << Z_AXIS;

/// Mask covering every configured axis.
pub const ALL_AXES_MASK: u8 = (1 << N_AXIS) - 1;

/// Axis letter for reports, by index.
pub const AXIS_LETTERS: [char; N_AXIS] = ['X', 'Y', 'Z'];

// ─── Line / Protocol ────────────────────────────────────────────────

/// Maximum accepted input line length, terminator included [bytes].
pub const MAX_LINE_LENGTH: usize = 80;

/// Largest accepted `N` line number; one beyond is rejected.
pub const MAX_LINE_NUMBER: u32 = 10_000_000;

/// Number of stored startup lines (`$N0`, `$N1`).
pub const N_STARTUP_LINES: usize = 2;

// ─── Planner / Stepper ──────────────────────────────────────────────

/// Planner block ring capacity. Must be a power of two.
pub const PLANNER_RING_CAPACITY: usize = 16;

/// Segment ring capacity between prep and the step interrupt.
pub const SEGMENT_RING_CAPACITY: usize = 6;

/// Segment slicing cadence [segments/s]; each segment spans ~1/this [s].
pub const ACCELERATION_TICKS_PER_SECOND: f32 = 100.0;

/// Step timer base frequency [ticks/s]. `cycles_per_tick` reloads count
/// in units of this clock.
pub const STEP_TIMER_FREQUENCY_HZ: u32 = 1_000_000;

/// Same, as float for rate math.
pub const STEP_TIMER_FREQUENCY: f32 = STEP_TIMER_FREQUENCY_HZ as f32;

/// Ceiling on the per-axis step rate the timer can deliver [steps/s].
pub const MAX_STEP_RATE_HZ: f32 = 30_000.0;

/// Adaptive multi-axis step smoothing: number of doubling levels.
pub const AMASS_MAX_LEVEL: u8 = 3;

/// AMASS level cutoffs as unsmoothed timer reloads: level 1 engages below
/// 8 kHz step rates, level 2 below 4 kHz, level 3 below 2 kHz.
pub const AMASS_LEVEL1_CYCLES: u32 = STEP_TIMER_FREQUENCY_HZ / 8_000;
pub const AMASS_LEVEL2_CYCLES: u32 = STEP_TIMER_FREQUENCY_HZ / 4_000;
pub const AMASS_LEVEL3_CYCLES: u32 = STEP_TIMER_FREQUENCY_HZ / 2_000;

/// Junction speed sentinel for collinear junctions [(mm/min)²].
pub const MAX_JUNCTION_SPEED_SQR: f32 = 1.0e30;

/// Floor for any planned junction speed [mm/min].
pub const MINIMUM_JUNCTION_SPEED: f32 = 0.0;

/// Floor for any programmed feed rate [mm/min].
pub const MINIMUM_FEED_RATE: f32 = 1.0;

/// Arc interpolation: small-angle correction interval [segments].
pub const N_ARC_CORRECTION: usize = 12;

/// Offset-form arcs whose angular travel is within this of zero are a
/// full circle, not a zero-length move [rad].
pub const ARC_ANGULAR_TRAVEL_EPSILON: f32 = 5.0e-7;

/// Dwell is sliced into checkpointed waits of this length [ms].
pub const DWELL_TIME_STEP_MS: u64 = 50;

// ─── Overrides ──────────────────────────────────────────────────────

/// Feed override bounds and increments [%].
pub const FEED_OVERRIDE_DEFAULT: u8 = 100;
pub const FEED_OVERRIDE_MAX: u8 = 200;
pub const FEED_OVERRIDE_MIN: u8 = 10;
pub const FEED_OVERRIDE_COARSE: u8 = 10;
pub const FEED_OVERRIDE_FINE: u8 = 1;

/// Rapid override steps [%].
pub const RAPID_OVERRIDE_DEFAULT: u8 = 100;
pub const RAPID_OVERRIDE_MEDIUM: u8 = 50;
pub const RAPID_OVERRIDE_LOW: u8 = 25;

// ─── Units ──────────────────────────────────────────────────────────

/// Millimetres per inch, for G20 input scaling and inch reports.
pub const MM_PER_INCH: f32 = 25.4;

/// Seconds → minutes conversion for rate math.
pub const SECONDS_PER_MINUTE: f32 = 60.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_masks_cover_all_axes() {
        assert_eq!(ALL_AXES_MASK, X_AXIS_BIT | Y_AXIS_BIT | Z_AXIS_BIT);
    }

    #[test]
    fn planner_ring_capacity_is_power_of_two() {
        assert!(PLANNER_RING_CAPACITY.is_power_of_two());
    }

    #[test]
    fn override_bounds_are_ordered() {
        assert!(FEED_OVERRIDE_MIN < FEED_OVERRIDE_DEFAULT);
        assert!(FEED_OVERRIDE_DEFAULT < FEED_OVERRIDE_MAX);
    }
}

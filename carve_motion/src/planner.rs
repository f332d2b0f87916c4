//! Trajectory planner: bounded block ring with junction-speed optimisation.
//!
//! Accepts millimetre targets plus a plan-line descriptor and produces
//! ordered motion blocks for the stepper, continually re-optimising the
//! entry speed of every queued-but-not-executing block.
//!
//! ## Ring discipline
//!
//! Producer-only mutation past the head index; the consumer frees blocks
//! only by advancing the tail. The head slot doubles as the speculative
//! build area, so a rejected block never disturbs the live ring, and as
//! the parking spot for one-shot system motions (homing, parking) that
//! bypass the queue.
//!
//! ## Optimality pointer
//!
//! `planned` marks the oldest block whose entry speed could still improve.
//! Blocks behind it are provably optimal (entry pinned at its ceiling, or
//! reachable from rest within the ring) and are never revisited.

use bitflags::bitflags;
use thiserror::Error;

use carve_common::consts::{
    MAX_JUNCTION_SPEED_SQR, MINIMUM_FEED_RATE, MINIMUM_JUNCTION_SPEED, N_AXIS,
    PLANNER_RING_CAPACITY,
};
use carve_common::settings::Settings;

static_assertions::const_assert!(PLANNER_RING_CAPACITY.is_power_of_two());

const RING_MASK: usize = PLANNER_RING_CAPACITY - 1;

bitflags! {
    /// Per-block condition bits carried from the parser.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Condition: u8 {
        /// Rapid (seek) motion: runs at the rapid rate, feed ignored.
        const RAPID_MOTION     = 0x01;
        /// One-shot system motion (homing/parking) bypassing the queue.
        const SYSTEM_MOTION    = 0x02;
        /// Feed override must not apply (G-code dwellers like homing locate).
        const NO_FEED_OVERRIDE = 0x04;
        /// Programmed rate is inverse-time: complete the move in 1/F min.
        const INVERSE_TIME     = 0x08;
    }
}

/// Per-line planner directives resolved by the parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanLineData {
    /// Programmed feed [mm/min], or 1/min when inverse-time.
    pub feed_rate: f32,
    /// Spindle speed commanded for this motion [RPM].
    pub spindle_rpm: f32,
    /// Condition bits.
    pub condition: Condition,
    /// Source line number for reports; 0 when untracked.
    pub line_number: u32,
}

/// One straight-line motion segment in step units.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanBlock {
    /// Absolute step count per axis (sign carried by `direction_bits`).
    pub steps: [u32; N_AXIS],
    /// Maximum of `steps[*]`: total Bresenham events to completion.
    pub step_event_count: u32,
    /// One-bit-per-axis sign flag; set bit = negative travel.
    pub direction_bits: u8,
    /// Condition bits.
    pub condition: Condition,
    /// Euclidean length of the move [mm].
    pub millimeters: f32,
    /// Move acceleration, axis-limit clipped [mm/min²].
    pub acceleration: f32,
    /// Junction speed squared at block entry, current plan [(mm/min)²].
    pub entry_speed_sqr: f32,
    /// Upper bound on `entry_speed_sqr` from the junction and neighbours.
    pub max_entry_speed_sqr: f32,
    /// Nominal (cruise) speed squared under current overrides [(mm/min)²].
    pub nominal_speed_sqr: f32,
    /// Junction-deviation ceiling for this block's entry [(mm/min)²].
    pub max_junction_speed_sqr: f32,
    /// Axis-limit rate ceiling along this direction [mm/min].
    pub rapid_rate: f32,
    /// User-programmed rate before overrides [mm/min or 1/min].
    pub programmed_rate: f32,
    /// Spindle speed for this block [RPM].
    pub spindle_rpm: f32,
    /// Source line number.
    pub line_number: u32,
}

/// Planner admission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlanError {
    /// Zero-length move: silently droppable, no block produced.
    #[error("zero-length move")]
    Empty,
    /// Ring is full; the caller must drain before retrying.
    #[error("planner buffer full")]
    BufferFull,
}

/// The block ring and its optimisation state.
#[derive(Debug)]
pub struct Planner {
    blocks: [PlanBlock; PLANNER_RING_CAPACITY],
    /// Producer index: next free slot, also the speculative build slot.
    head: usize,
    /// Consumer index: block currently executed by the stepper.
    tail: usize,
    /// Oldest block whose entry speed could still improve.
    planned: usize,
    /// Planner's own position in steps (target of the last queued block).
    position_steps: [i32; N_AXIS],
    /// Unit vector of the previous move, for junction geometry.
    previous_unit_vec: [f32; N_AXIS],
    /// Nominal speed of the previous move [mm/min].
    previous_nominal_speed: f32,
    /// Feed override [%], 10..=200.
    feed_override: u8,
    /// Rapid override [%], one of {100, 50, 25}.
    rapid_override: u8,
    /// Set when a recompute touched the executing block; the segment
    /// generator consumes this and re-plans mid-block.
    exec_dirty: bool,
}

impl Planner {
    pub fn new() -> Self {
        Self {
            blocks: [PlanBlock::default(); PLANNER_RING_CAPACITY],
            head: 0,
            tail: 0,
            planned: 0,
            position_steps: [0; N_AXIS],
            previous_unit_vec: [0.0; N_AXIS],
            previous_nominal_speed: 0.0,
            feed_override: 100,
            rapid_override: 100,
            exec_dirty: false,
        }
    }

    #[inline]
    fn next_index(index: usize) -> usize {
        (index + 1) & RING_MASK
    }

    #[inline]
    fn prev_index(index: usize) -> usize {
        index.wrapping_sub(1) & RING_MASK
    }

    /// True when no blocks are queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// True when the speculative slot would collide with the tail.
    #[inline]
    pub fn is_full(&self) -> bool {
        Self::next_index(self.head) == self.tail
    }

    /// Number of queued blocks.
    pub fn block_count(&self) -> usize {
        self.head.wrapping_sub(self.tail) & RING_MASK
    }

    /// The block the stepper is executing (ring tail), if any.
    pub fn exec_block(&self) -> Option<&PlanBlock> {
        if self.is_empty() {
            None
        } else {
            Some(&self.blocks[self.tail])
        }
    }

    /// The one-shot system block parked in the speculative slot.
    pub fn system_block(&self) -> &PlanBlock {
        &self.blocks[self.head]
    }

    /// Exit speed squared of the executing block: the entry speed of its
    /// successor, or zero at the end of the queue [(mm/min)²].
    pub fn exec_block_exit_speed_sqr(&self) -> f32 {
        let next = Self::next_index(self.tail);
        if next == self.head {
            0.0
        } else {
            self.blocks[next].entry_speed_sqr
        }
    }

    /// Consume the "executing block was re-planned" notification.
    pub fn take_exec_dirty(&mut self) -> bool {
        core::mem::take(&mut self.exec_dirty)
    }

    /// Freeze the executing block's entry speed at what the stepper is
    /// actually doing, before its remainder is re-planned.
    pub fn freeze_exec_entry(&mut self, speed_sqr: f32) {
        if !self.is_empty() {
            self.blocks[self.tail].entry_speed_sqr = speed_sqr;
        }
    }

    /// Write back the executing block's remaining length as the segment
    /// generator consumes it, so recompute passes see true distances.
    pub(crate) fn set_exec_block_millimeters(&mut self, millimeters: f32) {
        if !self.is_empty() {
            self.blocks[self.tail].millimeters = millimeters;
        }
    }

    /// Re-open the whole queue for optimisation and re-plan. Called when a
    /// cycle resumes from rest (hold, motion cancel) and after override
    /// changes have rewritten the profile ceilings.
    pub fn cycle_reinitialize(&mut self) {
        if self.is_empty() {
            return;
        }
        self.planned = self.tail;
        self.exec_dirty = true;
        self.recalculate();
    }

    /// Free the executing block. Consumer-side only.
    pub fn discard_current_block(&mut self) {
        if !self.is_empty() {
            let next = Self::next_index(self.tail);
            if self.tail == self.planned {
                self.planned = next;
            }
            self.tail = next;
        }
    }

    /// Planner position in steps (target of the newest queued block).
    pub fn position_steps(&self) -> [i32; N_AXIS] {
        self.position_steps
    }

    /// Resync the planner position from the authoritative step count.
    pub fn sync_position(&mut self, sys_steps: &[i32; N_AXIS]) {
        self.position_steps = *sys_steps;
        self.previous_unit_vec = [0.0; N_AXIS];
        self.previous_nominal_speed = 0.0;
    }

    /// Drop every queued block. Position is preserved; callers resync it
    /// separately when the machine actually moved.
    pub fn reset_buffer(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.planned = 0;
        self.exec_dirty = false;
        self.previous_unit_vec = [0.0; N_AXIS];
        self.previous_nominal_speed = 0.0;
    }

    /// Current feed override [%].
    pub fn feed_override(&self) -> u8 {
        self.feed_override
    }

    /// Current rapid override [%].
    pub fn rapid_override(&self) -> u8 {
        self.rapid_override
    }

    /// Apply new override percents and re-plan the whole queue.
    pub fn set_overrides(&mut self, feed: u8, rapid: u8) {
        if feed == self.feed_override && rapid == self.rapid_override {
            return;
        }
        tracing::debug!(feed, rapid, "overrides changed, re-planning queue");
        self.feed_override = feed;
        self.rapid_override = rapid;
        self.update_velocity_profile_parameters();
    }

    // ─── Block Construction ─────────────────────────────────────────

    /// Queue a straight-line motion to `target_mm`.
    ///
    /// System motions are parked in the speculative slot and do not move
    /// the ring or the planner position.
    pub fn buffer_line(
        &mut self,
        target_mm: &[f32; N_AXIS],
        data: &PlanLineData,
        settings: &Settings,
    ) -> Result<(), PlanError> {
        let system_motion = data.condition.contains(Condition::SYSTEM_MOTION);
        if !system_motion && self.is_full() {
            return Err(PlanError::BufferFull);
        }

        let mut block = PlanBlock {
            condition: data.condition,
            spindle_rpm: data.spindle_rpm,
            line_number: data.line_number,
            ..PlanBlock::default()
        };

        // Target in steps, per-axis deltas, direction bits, length.
        let mut target_steps = [0i32; N_AXIS];
        let mut unit_vec = [0.0f32; N_AXIS];
        for axis in 0..N_AXIS {
            target_steps[axis] = (target_mm[axis] * settings.steps_per_mm[axis]).round() as i32;
            let delta_steps = target_steps[axis] - self.position_steps[axis];
            block.steps[axis] = delta_steps.unsigned_abs();
            block.step_event_count = block.step_event_count.max(block.steps[axis]);
            let delta_mm = delta_steps as f32 / settings.steps_per_mm[axis];
            if delta_mm < 0.0 {
                block.direction_bits |= 1 << axis;
            }
            unit_vec[axis] = delta_mm;
            block.millimeters += delta_mm * delta_mm;
        }
        block.millimeters = block.millimeters.sqrt();
        if block.step_event_count == 0 {
            return Err(PlanError::Empty);
        }

        for value in unit_vec.iter_mut() {
            *value /= block.millimeters;
        }

        // Clip rate and acceleration to the tightest participating axis.
        let accel_limits: [f32; N_AXIS] =
            core::array::from_fn(|axis| settings.acceleration_mm_min2(axis));
        block.acceleration = limit_value_by_axis_maximum(&accel_limits, &unit_vec);
        block.rapid_rate = limit_value_by_axis_maximum(&settings.max_rate, &unit_vec);

        if data.condition.contains(Condition::RAPID_MOTION) {
            block.programmed_rate = block.rapid_rate;
        } else {
            block.programmed_rate = data.feed_rate;
            if data.condition.contains(Condition::INVERSE_TIME) {
                // F is moves-per-minute: rate that finishes in 1/F minutes.
                block.programmed_rate *= block.millimeters;
            }
        }

        // Junction speed against the previous path direction.
        if self.is_empty() || system_motion {
            block.entry_speed_sqr = 0.0;
            block.max_junction_speed_sqr = 0.0;
        } else {
            let mut junction_cos_theta = 0.0;
            for axis in 0..N_AXIS {
                junction_cos_theta -= self.previous_unit_vec[axis] * unit_vec[axis];
            }
            if junction_cos_theta > 0.999_999 {
                // Exact path reversal: come to a stop.
                block.max_junction_speed_sqr = MINIMUM_JUNCTION_SPEED * MINIMUM_JUNCTION_SPEED;
            } else if junction_cos_theta < -0.999_999 {
                // Collinear continuation: junction places no constraint.
                block.max_junction_speed_sqr = MAX_JUNCTION_SPEED_SQR;
            } else {
                // Centripetal cap from the junction-deviation circle.
                let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt();
                block.max_junction_speed_sqr = (MINIMUM_JUNCTION_SPEED
                    * MINIMUM_JUNCTION_SPEED)
                    .max(
                        block.acceleration * settings.junction_deviation * sin_theta_d2
                            / (1.0 - sin_theta_d2),
                    );
            }
        }

        let nominal_speed = self.compute_profile_nominal_speed(&block);
        block.nominal_speed_sqr = nominal_speed * nominal_speed;
        compute_profile_parameters(&mut block, nominal_speed, self.previous_nominal_speed);

        if system_motion {
            // Park in the speculative slot; ring and position untouched.
            self.blocks[self.head] = block;
            return Ok(());
        }

        self.previous_nominal_speed = nominal_speed;
        self.previous_unit_vec = unit_vec;

        self.blocks[self.head] = block;
        self.head = Self::next_index(self.head);
        self.position_steps = target_steps;

        self.recalculate();
        Ok(())
    }

    /// Nominal speed of a block under the current overrides [mm/min].
    pub fn compute_profile_nominal_speed(&self, block: &PlanBlock) -> f32 {
        let mut nominal_speed = block.programmed_rate;
        if block.condition.contains(Condition::RAPID_MOTION) {
            nominal_speed *= 0.01 * self.rapid_override as f32;
        } else {
            if !block.condition.contains(Condition::NO_FEED_OVERRIDE) {
                nominal_speed *= 0.01 * self.feed_override as f32;
            }
            if nominal_speed > block.rapid_rate {
                nominal_speed = block.rapid_rate;
            }
        }
        nominal_speed.max(MINIMUM_FEED_RATE)
    }

    /// Recompute every queued block's nominal speed and entry ceiling
    /// after an override change, then re-plan from the executing block.
    fn update_velocity_profile_parameters(&mut self) {
        let mut index = self.tail;
        let mut prev_nominal_speed = f32::MAX;
        while index != self.head {
            let nominal_speed = self.compute_profile_nominal_speed(&self.blocks[index]);
            let block = &mut self.blocks[index];
            block.nominal_speed_sqr = nominal_speed * nominal_speed;
            compute_profile_parameters(block, nominal_speed, prev_nominal_speed);
            prev_nominal_speed = nominal_speed;
            index = Self::next_index(index);
        }
        self.previous_nominal_speed = prev_nominal_speed;
        // Everything is re-optimisable again, including the active block.
        self.planned = self.tail;
        self.exec_dirty = true;
        self.recalculate();
    }

    // ─── Recompute Passes ───────────────────────────────────────────

    /// Reverse pass from the newest block toward `planned`, raising entry
    /// speeds to what deceleration allows; then forward pass capping each
    /// entry by what the predecessor can accelerate to.
    fn recalculate(&mut self) {
        if self.is_empty() {
            return;
        }
        let mut index = Self::prev_index(self.head);
        if index == self.planned {
            // Single unplanned block: nothing to optimise against.
            return;
        }

        // ── Reverse pass ──
        // Newest block always ends at rest.
        let mut next_entry_sqr = {
            let block = &mut self.blocks[index];
            block.entry_speed_sqr = block
                .max_entry_speed_sqr
                .min(2.0 * block.acceleration * block.millimeters);
            block.entry_speed_sqr
        };
        if index == self.tail {
            self.exec_dirty = true;
        }

        index = Self::prev_index(index);
        if index == self.planned {
            if index == self.tail {
                self.exec_dirty = true;
            }
        } else {
            while index != self.planned {
                if index == self.tail {
                    self.exec_dirty = true;
                }
                let block = &mut self.blocks[index];
                if block.entry_speed_sqr != block.max_entry_speed_sqr {
                    let reachable =
                        next_entry_sqr + 2.0 * block.acceleration * block.millimeters;
                    block.entry_speed_sqr = reachable.min(block.max_entry_speed_sqr);
                }
                next_entry_sqr = block.entry_speed_sqr;
                index = Self::prev_index(index);
            }
        }

        // ── Forward pass ──
        let mut current = self.planned;
        index = Self::next_index(self.planned);
        while index != self.head {
            let current_entry_sqr = self.blocks[current].entry_speed_sqr;
            let reachable = current_entry_sqr
                + 2.0 * self.blocks[current].acceleration * self.blocks[current].millimeters;
            let next_block = &mut self.blocks[index];
            if current_entry_sqr < next_block.entry_speed_sqr && reachable < next_block.entry_speed_sqr
            {
                next_block.entry_speed_sqr = reachable;
                // Acceleration-limited entry cannot improve further.
                self.planned = index;
            }
            if next_block.entry_speed_sqr == next_block.max_entry_speed_sqr {
                // Entry pinned at its ceiling: provably optimal.
                self.planned = index;
            }
            current = index;
            index = Self::next_index(index);
        }
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

/// Cap `max_entry_speed_sqr` by the junction ceiling and the slower of the
/// two neighbouring nominal speeds.
fn compute_profile_parameters(block: &mut PlanBlock, nominal_speed: f32, prev_nominal_speed: f32) {
    let cap = nominal_speed.min(prev_nominal_speed);
    block.max_entry_speed_sqr = (cap * cap).min(block.max_junction_speed_sqr);
}

/// Tightest per-axis limit scaled by that axis's participation ratio.
fn limit_value_by_axis_maximum(max_values: &[f32; N_AXIS], unit_vec: &[f32; N_AXIS]) -> f32 {
    let mut limit = f32::MAX;
    for axis in 0..N_AXIS {
        if unit_vec[axis] != 0.0 {
            limit = limit.min((max_values[axis] / unit_vec[axis]).abs());
        }
    }
    limit
}

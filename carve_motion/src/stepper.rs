//! Step-segment generator and the step-interrupt core.
//!
//! The prep phase (main loop) carves the head planner block's remaining
//! trajectory into short segments of roughly fixed duration and queues them
//! on a single-producer single-consumer ring. The interrupt core drains the
//! ring, emitting per-axis pulses via a Bresenham line algorithm at the
//! segment's timer reload rate.
//!
//! ## Boundary
//!
//! Everything the interrupt reads is either its own local cursor, an
//! immutable-after-publication stepper block, a queued segment, or an
//! atomic. The interrupt never allocates and never reads a planner block.
//!
//! ## AMASS
//!
//! At low step rates the interrupt tick rate is multiplied by 2^level and
//! Bresenham increments divided by the same, so multi-axis output stays
//! smooth without changing the total step count. Stepper-block step data is
//! premultiplied by the maximum level so the interrupt only ever shifts
//! down.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use carve_common::consts::{
    ACCELERATION_TICKS_PER_SECOND, AMASS_LEVEL1_CYCLES, AMASS_LEVEL2_CYCLES, AMASS_LEVEL3_CYCLES,
    AMASS_MAX_LEVEL, N_AXIS, SECONDS_PER_MINUTE, SEGMENT_RING_CAPACITY, STEP_TIMER_FREQUENCY,
};
use carve_common::settings::Settings;
use carve_common::state::{ExecState, RtFlags, StepControl};

use crate::planner::{PlanBlock, Planner};
use crate::position::SysPosition;

/// Stepper-block slots. One fewer than the segment ring: with at most
/// `SEGMENT_RING_CAPACITY - 1` segments queued and each block spanning at
/// least one segment, a slot cannot be rewritten while any queued or
/// executing segment still references it.
const ST_BLOCK_COUNT: usize = SEGMENT_RING_CAPACITY - 1;

/// Sentinel for "no stepper block loaded".
const ST_BLOCK_NONE: u8 = u8::MAX;

/// Segment slice duration [min].
const DT_SEGMENT: f32 = 1.0 / (ACCELERATION_TICKS_PER_SECOND * SECONDS_PER_MINUTE);

/// Minimum mm left in a segment so it carries at least one full step.
const REQ_MM_INCREMENT_SCALAR: f32 = 1.25;

// ─── Shared Records ─────────────────────────────────────────────────

/// Immutable-after-publication mirror of a planner block's Bresenham data.
///
/// Step counts are premultiplied by the maximum AMASS level.
#[derive(Debug, Clone, Copy, Default)]
pub struct StBlock {
    pub direction_bits: u8,
    pub steps: [u32; N_AXIS],
    pub step_event_count: u32,
}

/// A short constant-rate slice of a block's trajectory.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    /// Interrupt ticks in this segment (AMASS-adjusted).
    pub n_step: u16,
    /// Step timer reload [timer cycles per tick].
    pub cycles_per_tick: u32,
    /// Back-reference into the stepper-block cache.
    pub st_block_index: u8,
    /// AMASS subdivision level, 0..=3.
    pub amass_level: u8,
    /// Spindle PWM snapshot for this slice.
    pub spindle_pwm: u8,
}

/// The interrupt-crossing state: segment ring, stepper-block cache, the
/// authoritative position, and the halt latch.
pub struct StepperShared {
    segments: [UnsafeCell<Segment>; SEGMENT_RING_CAPACITY],
    st_blocks: [UnsafeCell<StBlock>; ST_BLOCK_COUNT],
    /// Producer index (prep).
    head: AtomicUsize,
    /// Consumer index (interrupt).
    tail: AtomicUsize,
    /// When set, the interrupt drops its work and idles until cleared.
    halt: AtomicBool,
    /// Machine position in steps; interrupt-owned.
    pub position: SysPosition,
}

// SAFETY: single-producer single-consumer discipline. The producer (prep,
// main loop) writes only the head segment slot before publishing it with a
// release store, and stepper-block slots only while no queued or executing
// segment references them (see ST_BLOCK_COUNT). The consumer (interrupt)
// reads only published slots after an acquire load. No slot is ever written
// and read concurrently.
unsafe impl Sync for StepperShared {}

impl StepperShared {
    pub fn new() -> Self {
        Self {
            segments: [const { UnsafeCell::new(Segment {
                n_step: 0,
                cycles_per_tick: 0,
                st_block_index: 0,
                amass_level: 0,
                spindle_pwm: 0,
            }) }; SEGMENT_RING_CAPACITY],
            st_blocks: [const { UnsafeCell::new(StBlock {
                direction_bits: 0,
                steps: [0; N_AXIS],
                step_event_count: 0,
            }) }; ST_BLOCK_COUNT],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            halt: AtomicBool::new(false),
            position: SysPosition::new(),
        }
    }

    /// True when no segments are queued.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// True when the producer cannot queue another segment.
    pub fn is_full(&self) -> bool {
        (self.head.load(Ordering::Relaxed) + 1) % SEGMENT_RING_CAPACITY
            == self.tail.load(Ordering::Acquire)
    }

    /// Queued segment count.
    pub fn segment_count(&self) -> usize {
        (self.head.load(Ordering::Acquire) + SEGMENT_RING_CAPACITY
            - self.tail.load(Ordering::Acquire))
            % SEGMENT_RING_CAPACITY
    }

    /// Park the interrupt: it drops in-flight work and idles.
    pub fn set_halt(&self, halted: bool) {
        self.halt.store(halted, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    /// Clear both rings. Only valid while the interrupt is halted.
    pub fn reset_rings(&self) {
        debug_assert!(self.is_halted());
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
    }

    // Producer side.

    fn push_segment(&self, segment: Segment) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % SEGMENT_RING_CAPACITY;
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        // SAFETY: `head` is producer-owned and unpublished; the consumer
        // cannot read this slot until the release store below.
        unsafe { *self.segments[head].get() = segment };
        self.head.store(next, Ordering::Release);
        true
    }

    fn write_st_block(&self, index: usize, block: StBlock) {
        // SAFETY: the producer only reuses a stepper-block slot after every
        // segment referencing it has been consumed (ring-occupancy
        // argument at ST_BLOCK_COUNT).
        unsafe { *self.st_blocks[index].get() = block };
    }

    // Consumer side.

    fn peek_segment(&self) -> Option<Segment> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the slot was published by the producer's release store,
        // observed by the acquire load above.
        Some(unsafe { *self.segments[tail].get() })
    }

    fn free_segment(&self) {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail != self.head.load(Ordering::Acquire) {
            self.tail
                .store((tail + 1) % SEGMENT_RING_CAPACITY, Ordering::Release);
        }
    }

    fn read_st_block(&self, index: usize) -> StBlock {
        // SAFETY: a block slot referenced by a queued segment is never
        // rewritten until that segment is consumed.
        unsafe { *self.st_blocks[index].get() }
    }
}

impl Default for StepperShared {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Pulse Output ───────────────────────────────────────────────────

/// Step/direction pin contract. The interrupt asserts pulses here; the
/// pulse-low edge arrives at the start of the next tick, standing in for
/// the one-shot pulse timer.
pub trait StepPulseSink: Send {
    /// Raise step pins for the masked axes, directions per `dir_bits`.
    fn begin_pulse(&mut self, step_bits: u8, dir_bits: u8);
    /// Lower any pins asserted in the previous tick.
    fn end_pulse(&mut self);
}

/// Counting sink for tests and simulation runs.
#[derive(Debug, Default)]
pub struct CountingPins {
    /// Pulses seen per axis.
    pub steps: [u32; N_AXIS],
    /// Pulses seen per axis while the direction bit was set.
    pub negative_steps: [u32; N_AXIS],
    /// Step pins currently asserted (between begin and end of a pulse).
    pub pulse_high: bool,
}

impl StepPulseSink for CountingPins {
    fn begin_pulse(&mut self, step_bits: u8, dir_bits: u8) {
        for axis in 0..N_AXIS {
            if step_bits & (1 << axis) != 0 {
                self.steps[axis] += 1;
                if dir_bits & (1 << axis) != 0 {
                    self.negative_steps[axis] += 1;
                }
            }
        }
        self.pulse_high = true;
    }

    fn end_pulse(&mut self) {
        self.pulse_high = false;
    }
}

// ─── Interrupt Core ─────────────────────────────────────────────────

/// Outcome of one interrupt tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    /// A segment is executing; reschedule at the current reload rate.
    Busy,
    /// Nothing to do; the cycle-stop flag was raised on the transition.
    Idle,
}

/// The periodic step interrupt, one instance on the tick thread.
pub struct StepperIsr {
    shared: Arc<StepperShared>,
    rt_flags: Arc<RtFlags>,
    exec_segment: Option<Segment>,
    exec_block: StBlock,
    exec_block_index: u8,
    /// AMASS-adjusted Bresenham increments for the active segment.
    steps_adj: [u32; N_AXIS],
    /// Per-axis Bresenham error counters.
    counters: [u32; N_AXIS],
    /// Ticks left in the active segment.
    step_count: u16,
    /// True while pulses are being produced; edges the cycle-stop flag.
    busy: bool,
}

impl StepperIsr {
    pub fn new(shared: Arc<StepperShared>, rt_flags: Arc<RtFlags>) -> Self {
        Self {
            shared,
            rt_flags,
            exec_segment: None,
            exec_block: StBlock::default(),
            exec_block_index: ST_BLOCK_NONE,
            steps_adj: [0; N_AXIS],
            counters: [0; N_AXIS],
            step_count: 0,
            busy: false,
        }
    }

    /// Timer reload of the active segment, for tick pacing.
    pub fn cycles_per_tick(&self) -> Option<u32> {
        self.exec_segment.map(|s| s.cycles_per_tick)
    }

    /// Execute one interrupt tick against the pins.
    pub fn tick(&mut self, pins: &mut dyn StepPulseSink) -> TickResult {
        // Pulse-low phase for whatever the previous tick asserted.
        pins.end_pulse();

        if self.shared.is_halted() {
            self.exec_segment = None;
            self.exec_block_index = ST_BLOCK_NONE;
            self.busy = false;
            return TickResult::Idle;
        }

        if self.exec_segment.is_none() {
            match self.shared.peek_segment() {
                Some(segment) => {
                    if segment.st_block_index != self.exec_block_index {
                        self.exec_block_index = segment.st_block_index;
                        self.exec_block =
                            self.shared.read_st_block(segment.st_block_index as usize);
                        let half = self.exec_block.step_event_count >> 1;
                        self.counters = [half; N_AXIS];
                    }
                    for axis in 0..N_AXIS {
                        self.steps_adj[axis] =
                            self.exec_block.steps[axis] >> segment.amass_level;
                    }
                    self.step_count = segment.n_step;
                    self.exec_segment = Some(segment);
                    self.busy = true;
                }
                None => {
                    if self.busy {
                        self.busy = false;
                        self.rt_flags.set_state(ExecState::CYCLE_STOP);
                    }
                    return TickResult::Idle;
                }
            }
        }

        // Bresenham step displacement for every participating axis.
        let mut step_bits = 0u8;
        for axis in 0..N_AXIS {
            self.counters[axis] += self.steps_adj[axis];
            if self.counters[axis] > self.exec_block.step_event_count {
                step_bits |= 1 << axis;
                self.counters[axis] -= self.exec_block.step_event_count;
                self.shared
                    .position
                    .step(axis, self.exec_block.direction_bits & (1 << axis) != 0);
            }
        }
        if step_bits != 0 {
            pins.begin_pulse(step_bits, self.exec_block.direction_bits);
        }

        self.step_count -= 1;
        if self.step_count == 0 {
            self.exec_segment = None;
            self.shared.free_segment();
        }
        TickResult::Busy
    }

    /// Forget all in-flight state. Call with the interrupt parked.
    pub fn reset(&mut self) {
        self.exec_segment = None;
        self.exec_block_index = ST_BLOCK_NONE;
        self.step_count = 0;
        self.busy = false;
    }
}

// ─── Segment Prep ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RampType {
    /// Decelerating down to a lowered nominal speed (override reduction).
    DecelOverride,
    Accel,
    Cruise,
    Decel,
}

/// Segment-generation outcome for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepResult {
    /// Ring is topped up (or there is nothing to do).
    Ok,
    /// A forced deceleration reached zero speed mid-block; motion has been
    /// flagged to end with steps still owed on the block.
    HoldComplete,
}

/// The prep phase: slices the active block's trajectory into segments.
///
/// Main-loop side only. All planner access happens here; the interrupt
/// sees only the records this produces.
pub struct SegmentPrep {
    shared: Arc<StepperShared>,
    /// Next stepper-block slot to claim.
    st_block_index: usize,
    /// A block is loaded and mid-slicing.
    has_block: bool,
    /// Reload the active block but keep its step progress (profile resync).
    replan: bool,
    /// The loaded block is the one-shot system block.
    is_system: bool,
    /// Snapshot of the active block's scalars.
    acceleration: f32,
    millimeters: f32,
    spindle_rpm: f32,
    /// Steps still owed on the active block (fractional carry).
    steps_remaining: f32,
    step_per_mm: f32,
    req_mm_increment: f32,
    dt_remainder: f32,
    /// Remaining mm at which motion must stop (feed hold), else zero.
    mm_complete: f32,
    current_speed: f32,
    maximum_speed: f32,
    exit_speed: f32,
    /// Ramp boundaries in mm-remaining-from-block-end terms.
    accelerate_until: f32,
    decelerate_after: f32,
    ramp_type: RampType,
}

impl SegmentPrep {
    pub fn new(shared: Arc<StepperShared>) -> Self {
        Self {
            shared,
            st_block_index: 0,
            has_block: false,
            replan: false,
            is_system: false,
            acceleration: 0.0,
            millimeters: 0.0,
            spindle_rpm: 0.0,
            steps_remaining: 0.0,
            step_per_mm: 0.0,
            req_mm_increment: 0.0,
            dt_remainder: 0.0,
            mm_complete: 0.0,
            current_speed: 0.0,
            maximum_speed: 0.0,
            exit_speed: 0.0,
            accelerate_until: 0.0,
            decelerate_after: 0.0,
            ramp_type: RampType::Accel,
        }
    }

    /// Speed the stepper is tracking right now [mm/min].
    pub fn current_speed(&self) -> f32 {
        self.current_speed
    }

    /// True while a block is loaded or owed steps remain (hold partial).
    pub fn has_partial_block(&self) -> bool {
        self.has_block || self.steps_remaining > 0.0
    }

    /// Drop all prep state. Pairs with a ring reset.
    pub fn reset(&mut self) {
        let shared = Arc::clone(&self.shared);
        *self = Self::new(shared);
    }

    /// Freeze the active block's entry at the current speed and force a
    /// profile reload that keeps step progress. Called on feed hold, on
    /// override changes, and whenever the planner re-plans the tail.
    pub fn flag_replan(&mut self, planner: &mut Planner) {
        if self.has_block && !self.is_system {
            planner.freeze_exec_entry(self.current_speed * self.current_speed);
            self.has_block = false;
            self.replan = true;
        }
    }

    /// Keep the segment ring topped up from the planner.
    pub fn fill(
        &mut self,
        planner: &mut Planner,
        step_control: &mut StepControl,
        settings: &Settings,
    ) -> PrepResult {
        if step_control.contains(StepControl::END_MOTION) {
            return PrepResult::Ok;
        }
        if planner.take_exec_dirty() {
            self.flag_replan(planner);
        }

        while !self.shared.is_full() {
            if !self.has_block && !self.load_block(planner, step_control) {
                return PrepResult::Ok;
            }

            match self.prep_segment(planner, step_control, settings) {
                SegmentOutcome::Queued => {}
                SegmentOutcome::BlockDone => {
                    self.has_block = false;
                    if self.is_system {
                        step_control.insert(StepControl::END_MOTION);
                        return PrepResult::Ok;
                    }
                    planner.discard_current_block();
                }
                SegmentOutcome::HoldDone => {
                    step_control.insert(StepControl::END_MOTION);
                    return PrepResult::HoldComplete;
                }
            }
        }
        PrepResult::Ok
    }

    /// Load the next block (or resume a re-planned one). Returns false
    /// when there is nothing to execute.
    fn load_block(&mut self, planner: &mut Planner, step_control: &StepControl) -> bool {
        let system = step_control.contains(StepControl::EXECUTE_SYS_MOTION);
        let block: PlanBlock = if system {
            *planner.system_block()
        } else {
            match planner.exec_block() {
                Some(block) => *block,
                None => return false,
            }
        };

        if self.replan {
            // Keep steps_remaining / step_per_mm: only the velocity
            // profile is recomputed, from the frozen current speed.
            self.replan = false;
        } else {
            self.st_block_index = (self.st_block_index + 1) % ST_BLOCK_COUNT;
            self.shared.write_st_block(
                self.st_block_index,
                StBlock {
                    direction_bits: block.direction_bits,
                    steps: core::array::from_fn(|axis| {
                        block.steps[axis] << AMASS_MAX_LEVEL
                    }),
                    step_event_count: block.step_event_count << AMASS_MAX_LEVEL,
                },
            );
            self.steps_remaining = block.step_event_count as f32;
            self.step_per_mm = self.steps_remaining / block.millimeters;
            self.req_mm_increment = REQ_MM_INCREMENT_SCALAR / self.step_per_mm;
            self.dt_remainder = 0.0;
            self.current_speed = block.entry_speed_sqr.sqrt();
        }

        self.is_system = system;
        self.acceleration = block.acceleration;
        self.millimeters = block.millimeters;
        self.spindle_rpm = block.spindle_rpm;
        self.has_block = true;

        self.compute_profile(planner, step_control, &block);
        true
    }

    /// Compute the ramp boundaries for the (re)loaded block.
    fn compute_profile(
        &mut self,
        planner: &Planner,
        step_control: &StepControl,
        block: &PlanBlock,
    ) {
        self.mm_complete = 0.0;
        let inv_2_accel = 0.5 / self.acceleration;
        let entry_speed_sqr = self.current_speed * self.current_speed;

        if step_control.contains(StepControl::EXECUTE_HOLD) {
            // Forced deceleration to zero, possibly spanning blocks.
            self.ramp_type = RampType::Decel;
            let decel_dist = self.millimeters - inv_2_accel * entry_speed_sqr;
            if decel_dist < 0.0 {
                // Entire block is deceleration; carry speed into the next.
                self.exit_speed =
                    (entry_speed_sqr - 2.0 * self.acceleration * self.millimeters).sqrt();
            } else {
                self.mm_complete = decel_dist;
                self.exit_speed = 0.0;
            }
            return;
        }

        self.ramp_type = RampType::Accel;
        self.accelerate_until = self.millimeters;

        let exit_speed_sqr = if self.is_system {
            0.0
        } else {
            planner.exec_block_exit_speed_sqr()
        };
        self.exit_speed = exit_speed_sqr.sqrt();

        let nominal_speed = planner.compute_profile_nominal_speed(block);
        let nominal_speed_sqr = nominal_speed * nominal_speed;

        if entry_speed_sqr > nominal_speed_sqr {
            // Only after an override reduction mid-block.
            self.accelerate_until =
                self.millimeters - inv_2_accel * (entry_speed_sqr - nominal_speed_sqr);
            if self.accelerate_until <= 0.0 {
                // Not even room to reach the new nominal: pure deceleration.
                self.ramp_type = RampType::Decel;
                self.exit_speed =
                    (entry_speed_sqr - 2.0 * self.acceleration * self.millimeters)
                        .max(exit_speed_sqr)
                        .sqrt();
            } else {
                self.decelerate_after = inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                self.maximum_speed = nominal_speed;
                self.ramp_type = RampType::DecelOverride;
            }
            return;
        }

        let intersect_distance =
            0.5 * (self.millimeters + inv_2_accel * (entry_speed_sqr - exit_speed_sqr));
        if intersect_distance > 0.0 {
            if intersect_distance < self.millimeters {
                self.decelerate_after = inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                if self.decelerate_after < intersect_distance {
                    // Trapezoid: accelerate, cruise at nominal, decelerate.
                    self.maximum_speed = nominal_speed;
                    if entry_speed_sqr == nominal_speed_sqr {
                        self.ramp_type = RampType::Cruise;
                    } else {
                        self.accelerate_until -=
                            inv_2_accel * (nominal_speed_sqr - entry_speed_sqr);
                    }
                } else {
                    // Triangle: the ramps meet below nominal.
                    self.accelerate_until = intersect_distance;
                    self.decelerate_after = intersect_distance;
                    self.maximum_speed = (2.0 * self.acceleration * intersect_distance
                        + exit_speed_sqr)
                        .sqrt();
                }
            } else {
                // Deceleration across the whole block.
                self.ramp_type = RampType::Decel;
            }
        } else {
            // Acceleration across the whole block.
            self.accelerate_until = 0.0;
        }
    }

    /// Generate and queue one segment. Assumes a loaded block.
    fn prep_segment(
        &mut self,
        planner: &mut Planner,
        step_control: &mut StepControl,
        settings: &Settings,
    ) -> SegmentOutcome {
        let mut dt_max = DT_SEGMENT;
        let mut dt = 0.0f32;
        let mut time_var = dt_max;
        let mut mm_remaining = self.millimeters;
        let minimum_mm = (mm_remaining - self.req_mm_increment).max(0.0);

        // Integrate the velocity profile over the segment duration,
        // splitting at ramp junctions.
        loop {
            match self.ramp_type {
                RampType::DecelOverride => {
                    let speed_var = self.acceleration * time_var;
                    if self.current_speed - self.maximum_speed <= speed_var {
                        // Ramp down to the lowered nominal completes here.
                        mm_remaining = self.accelerate_until;
                        time_var = 2.0 * (self.millimeters - mm_remaining)
                            / (self.current_speed + self.maximum_speed);
                        if mm_remaining == self.decelerate_after {
                            self.ramp_type = RampType::Decel;
                        } else {
                            self.ramp_type = RampType::Cruise;
                        }
                        self.current_speed = self.maximum_speed;
                    } else {
                        mm_remaining -= time_var * (self.current_speed - 0.5 * speed_var);
                        self.current_speed -= speed_var;
                    }
                }
                RampType::Accel => {
                    let speed_var = self.acceleration * time_var;
                    mm_remaining -= time_var * (self.current_speed + 0.5 * speed_var);
                    if mm_remaining < self.accelerate_until {
                        // End of the acceleration ramp inside this slice.
                        mm_remaining = self.accelerate_until;
                        time_var = 2.0 * (self.millimeters - mm_remaining)
                            / (self.current_speed + self.maximum_speed);
                        if mm_remaining == self.decelerate_after {
                            self.ramp_type = RampType::Decel;
                        } else {
                            self.ramp_type = RampType::Cruise;
                        }
                        self.current_speed = self.maximum_speed;
                    } else {
                        self.current_speed += speed_var;
                    }
                }
                RampType::Cruise => {
                    let mm_var = mm_remaining - self.maximum_speed * time_var;
                    if mm_var < self.decelerate_after {
                        // End of the cruise inside this slice.
                        time_var =
                            (mm_remaining - self.decelerate_after) / self.maximum_speed;
                        mm_remaining = self.decelerate_after;
                        self.ramp_type = RampType::Decel;
                    } else {
                        mm_remaining = mm_var;
                    }
                }
                RampType::Decel => {
                    let speed_var = self.acceleration * time_var;
                    let mut mid_ramp = false;
                    if self.current_speed > speed_var {
                        let mm_var =
                            mm_remaining - time_var * (self.current_speed - 0.5 * speed_var);
                        if mm_var > self.mm_complete {
                            // Still decelerating within the block.
                            mm_remaining = mm_var;
                            self.current_speed -= speed_var;
                            mid_ramp = true;
                        }
                    }
                    if !mid_ramp {
                        // End of block or of the forced deceleration.
                        time_var = 2.0 * (mm_remaining - self.mm_complete)
                            / (self.current_speed + self.exit_speed);
                        mm_remaining = self.mm_complete;
                        self.current_speed = self.exit_speed;
                    }
                }
            }

            dt += time_var;
            if dt < dt_max {
                // At a ramp junction: continue with the remaining time.
                time_var = dt_max - dt;
            } else if mm_remaining > minimum_mm {
                // Very slow segment: stretch it so it carries a full step.
                dt_max += DT_SEGMENT;
                time_var = dt_max - dt;
            } else {
                break;
            }
            if mm_remaining <= self.mm_complete {
                break;
            }
        }

        // Steps for this slice, with fractional carry across segments.
        let step_dist_remaining = self.step_per_mm * mm_remaining;
        let n_steps_remaining = step_dist_remaining.ceil();
        let last_n_steps_remaining = self.steps_remaining.ceil();
        let n_step = (last_n_steps_remaining - n_steps_remaining) as u16;

        if n_step == 0 {
            // Zero-step slice only happens at the tail of a forced
            // deceleration; the hold point is effectively reached.
            if step_control.contains(StepControl::EXECUTE_HOLD) {
                return self.finish_forced_termination(planner, step_dist_remaining);
            }
        }

        dt += self.dt_remainder;
        let inv_rate = dt / (last_n_steps_remaining - step_dist_remaining);

        let mut cycles =
            (STEP_TIMER_FREQUENCY * SECONDS_PER_MINUTE * inv_rate).ceil() as u32;
        let mut segment = Segment {
            n_step,
            cycles_per_tick: 0,
            st_block_index: self.st_block_index as u8,
            amass_level: 0,
            spindle_pwm: spindle_pwm(self.spindle_rpm, settings),
        };
        if cycles >= AMASS_LEVEL1_CYCLES {
            segment.amass_level = if cycles < AMASS_LEVEL2_CYCLES {
                1
            } else if cycles < AMASS_LEVEL3_CYCLES {
                2
            } else {
                AMASS_MAX_LEVEL
            };
            cycles >>= segment.amass_level;
            segment.n_step <<= segment.amass_level;
        }
        segment.cycles_per_tick = cycles;

        let pushed = self.shared.push_segment(segment);
        debug_assert!(pushed, "fill() guards on ring capacity");

        // Advance block bookkeeping.
        self.millimeters = mm_remaining;
        self.steps_remaining = n_steps_remaining;
        self.dt_remainder = (n_steps_remaining - step_dist_remaining) * inv_rate;
        if !self.is_system {
            planner.set_exec_block_millimeters(mm_remaining);
        }

        if mm_remaining == self.mm_complete {
            if mm_remaining > 0.0 {
                return self.finish_forced_termination(planner, step_dist_remaining);
            }
            return SegmentOutcome::BlockDone;
        }
        SegmentOutcome::Queued
    }

    /// A feed hold decelerated to zero with travel still owed on the
    /// block. Park the partial block for resume.
    fn finish_forced_termination(
        &mut self,
        planner: &mut Planner,
        step_dist_remaining: f32,
    ) -> SegmentOutcome {
        tracing::debug!(
            steps_owed = step_dist_remaining.ceil(),
            "forced deceleration complete, block parked"
        );
        self.current_speed = 0.0;
        self.dt_remainder = 0.0;
        self.steps_remaining = step_dist_remaining.ceil();
        let mm = self.steps_remaining / self.step_per_mm;
        self.millimeters = mm;
        planner.set_exec_block_millimeters(mm);
        planner.freeze_exec_entry(0.0);
        self.has_block = false;
        self.replan = true;
        SegmentOutcome::HoldDone
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentOutcome {
    Queued,
    BlockDone,
    HoldDone,
}

/// Spindle PWM snapshot for a segment: linear RPM → 0..=255 scale.
fn spindle_pwm(rpm: f32, settings: &Settings) -> u8 {
    if rpm <= 0.0 || settings.rpm_max <= 0.0 {
        return 0;
    }
    let clamped = rpm.clamp(settings.rpm_min, settings.rpm_max);
    ((clamped / settings.rpm_max) * 255.0).round() as u8
}

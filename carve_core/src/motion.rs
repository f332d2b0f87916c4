//! Motion-control entry points: the layer between the interpreter and
//! the planner.
//!
//! Every long-running operation here contains realtime checkpoints so
//! holds, overrides, and resets keep working while the main loop is busy
//! interpolating an arc or waiting on a full planner ring.

use std::time::Duration;

use carve_common::alarm::Alarm;
use carve_common::consts::{
    ARC_ANGULAR_TRAVEL_EPSILON, DWELL_TIME_STEP_MS, N_ARC_CORRECTION, N_AXIS, X_AXIS, Y_AXIS,
    Z_AXIS,
};
use carve_common::state::{ExecState, MachineState, StepControl, Suspend};
use carve_motion::planner::{Condition, PlanError, PlanLineData};
use tracing::{debug, warn};

use crate::gcode::GcUpdatePos;
use crate::machine::Machine;
use carve_common::status::Status;

impl Machine {
    /// Plan a straight-line motion to `target` (machine coords, mm).
    ///
    /// Blocks (with realtime checkpoints) while the planner ring is full.
    /// Soft-limit violations decelerate the machine and raise an alarm
    /// instead of planning.
    pub fn mc_line(&mut self, target: &[f32; N_AXIS], pl_data: &PlanLineData) -> Result<(), Status> {
        if self.settings.soft_limits
            && !pl_data.condition.contains(Condition::SYSTEM_MOTION)
            && self.outside_travel(target)
        {
            warn!(?target, "soft limit: target outside machine travel");
            if self.state == MachineState::Cycle {
                // Stop the machine under control before alarming.
                self.rt_flags.set_state(ExecState::FEED_HOLD);
                while !self.abort && !self.suspend.contains(Suspend::HOLD_COMPLETE) {
                    self.execute_realtime();
                    self.pump_motion();
                }
            }
            self.rt_flags.set_alarm(Alarm::SoftLimit);
            self.execute_realtime();
            return Ok(());
        }

        if self.check_mode() {
            return Ok(());
        }

        loop {
            if self.abort {
                return Ok(());
            }
            match self.planner.buffer_line(target, pl_data, &self.settings) {
                Ok(()) | Err(PlanError::Empty) => return Ok(()),
                Err(PlanError::BufferFull) => {
                    // Ring full: keep the machine alive until a slot opens.
                    self.execute_realtime();
                    self.auto_cycle_start();
                    self.pump_motion();
                }
            }
        }
    }

    /// Interpolate an arc as small line segments under the arc tolerance.
    ///
    /// `offset` is the centre offset from the start point on the XY plane.
    pub fn mc_arc(
        &mut self,
        target: &[f32; N_AXIS],
        pl_data: &PlanLineData,
        offset: [f32; 2],
        radius: f32,
        is_clockwise: bool,
    ) -> Result<(), Status> {
        let position = self.gc.position;
        let center = [position[X_AXIS] + offset[0], position[Y_AXIS] + offset[1]];
        let mut r_axis0 = -offset[0];
        let mut r_axis1 = -offset[1];
        let rt_axis0 = target[X_AXIS] - center[0];
        let rt_axis1 = target[Y_AXIS] - center[1];

        // CCW angle between position and target from the centre.
        let mut angular_travel =
            (r_axis0 * rt_axis1 - r_axis1 * rt_axis0).atan2(r_axis0 * rt_axis0 + r_axis1 * rt_axis1);
        if is_clockwise {
            if angular_travel >= -ARC_ANGULAR_TRAVEL_EPSILON {
                // Coincident endpoints within the epsilon: full circle.
                angular_travel -= 2.0 * core::f32::consts::PI;
            }
        } else if angular_travel <= ARC_ANGULAR_TRAVEL_EPSILON {
            angular_travel += 2.0 * core::f32::consts::PI;
        }

        // Chord error stays within the arc tolerance at this segment count.
        let segments = ((0.5 * angular_travel.abs() * radius)
            / (self.settings.arc_tolerance * (2.0 * radius - self.settings.arc_tolerance)).sqrt())
        .floor() as u32;

        let mut pl_data = *pl_data;
        if segments > 0 {
            if pl_data.condition.contains(Condition::INVERSE_TIME) {
                // The programmed time applies to the whole arc, so each
                // segment gets an equal share.
                pl_data.feed_rate *= segments as f32;
                pl_data.condition.remove(Condition::INVERSE_TIME);
            }

            let theta_per_segment = angular_travel / segments as f32;
            let linear_per_segment = (target[Z_AXIS] - position[Z_AXIS]) / segments as f32;

            // Small-angle rotation with periodic exact correction.
            let mut cos_t = 2.0 - theta_per_segment * theta_per_segment;
            let sin_t = theta_per_segment * 0.166_666_67 * (cos_t + 4.0);
            cos_t *= 0.5;

            let mut arc_target = position;
            let mut count = 0usize;
            for i in 1..segments {
                if count < N_ARC_CORRECTION {
                    let r_axisi = r_axis0 * sin_t + r_axis1 * cos_t;
                    r_axis0 = r_axis0 * cos_t - r_axis1 * sin_t;
                    r_axis1 = r_axisi;
                    count += 1;
                } else {
                    // Exact trig re-seed to cancel accumulated drift.
                    let cos_ti = (i as f32 * theta_per_segment).cos();
                    let sin_ti = (i as f32 * theta_per_segment).sin();
                    r_axis0 = -offset[0] * cos_ti + offset[1] * sin_ti;
                    r_axis1 = -offset[0] * sin_ti - offset[1] * cos_ti;
                    count = 0;
                }

                arc_target[X_AXIS] = center[0] + r_axis0;
                arc_target[Y_AXIS] = center[1] + r_axis1;
                arc_target[Z_AXIS] += linear_per_segment;

                self.mc_line(&arc_target, &pl_data)?;
                if self.abort {
                    return Ok(());
                }
            }
        }
        // Land exactly on the programmed target.
        self.mc_line(target, &pl_data)
    }

    /// Drain queued motion, then wait in checkpointed slices.
    pub fn mc_dwell(&mut self, seconds: f32) {
        if self.check_mode() || seconds <= 0.0 {
            return;
        }
        self.buffer_synchronize();
        let total_ms = (seconds * 1000.0).ceil() as u64;
        let mut waited = 0u64;
        while waited < total_ms && !self.abort {
            self.execute_realtime();
            let chunk = DWELL_TIME_STEP_MS.min(total_ms - waited);
            std::thread::sleep(Duration::from_millis(chunk));
            waited += chunk;
        }
    }

    /// Probe cycle (G38.x): run toward `target` until the probe changes
    /// state, then halt and record the contact position.
    pub fn mc_probe_cycle(
        &mut self,
        target: &[f32; N_AXIS],
        pl_data: &PlanLineData,
        away: bool,
        no_error: bool,
    ) -> Result<GcUpdatePos, Status> {
        if self.check_mode() {
            return Ok(GcUpdatePos::None);
        }
        self.buffer_synchronize();
        if self.abort {
            return Ok(GcUpdatePos::None);
        }

        // The probe must start on the released (or, probing away, the
        // contacted) side.
        if self.probe.is_triggered() != away {
            self.rt_flags.set_alarm(Alarm::ProbeFailInitial);
            self.execute_realtime();
            return Ok(GcUpdatePos::None);
        }

        self.probe_succeeded = false;
        self.mc_line(target, pl_data)?;
        self.state = MachineState::Cycle;

        loop {
            self.pump_motion();
            self.execute_realtime();
            if self.abort {
                return Ok(GcUpdatePos::None);
            }

            if self.probe.is_triggered() != away {
                // Contact: stop now, remember where.
                self.flush_motion();
                self.planner.reset_buffer();
                self.probe_position = self.shared.position.snapshot();
                self.probe_succeeded = true;
                self.planner.sync_position(&self.probe_position);
                self.state = MachineState::Idle;
                self.report_probe_result();
                debug!(position = ?self.probe_position, "probe contact");
                return Ok(GcUpdatePos::System);
            }

            if self.motion_drained() {
                // Ran out of travel without a state change.
                self.probe_position = self.shared.position.snapshot();
                self.state = MachineState::Idle;
                if no_error {
                    self.report_probe_result();
                    return Ok(GcUpdatePos::System);
                }
                self.rt_flags.set_alarm(Alarm::ProbeFailContact);
                self.execute_realtime();
                return Ok(GcUpdatePos::None);
            }
        }
    }

    // ─── Homing ─────────────────────────────────────────────────────

    /// Full homing cycle: Z clears first, then X, then Y. On success the
    /// machine origin is re-established and both position shadows resync.
    pub fn mc_homing_cycle(&mut self) -> bool {
        self.state = MachineState::Homing;
        for axis in [Z_AXIS, X_AXIS, Y_AXIS] {
            if let Err(alarm) = self.home_axis(axis) {
                warn!(axis, code = alarm.code(), "homing failed");
                self.mc_reset();
                self.rt_flags.set_alarm(alarm);
                self.execute_realtime();
                return false;
            }
        }
        self.planner.sync_position(&self.shared.position.snapshot());
        self.gc.position = self.machine_position_mm();
        self.homed = true;
        self.state = MachineState::Idle;
        debug!("homing cycle complete");
        true
    }

    /// Home one axis: seek to the switch, pull off, locate slowly, pull
    /// off again, then declare the axis origin.
    fn home_axis(&mut self, axis: usize) -> Result<(), Alarm> {
        let dir_negative = self.settings.homing_dir_mask & (1 << axis) != 0;
        let sign = if dir_negative { -1.0 } else { 1.0 };
        let pulloff = self.settings.homing_pulloff;
        let seek_rate = self.settings.homing_seek_rate;
        let feed_rate = self.settings.homing_feed_rate;
        let search_travel = 1.5 * self.settings.max_travel[axis];

        // Approach at seek rate until the switch closes.
        if !self.homing_move(axis, sign * search_travel, seek_rate, true)? {
            return Err(Alarm::HomingFailApproach);
        }
        self.homing_debounce();

        // Pull clear of the switch.
        self.homing_move(axis, -sign * pulloff, seek_rate, false)?;
        if self.limits.limit_state() & (1 << axis) != 0 {
            return Err(Alarm::HomingFailPulloff);
        }

        // Locate precisely at feed rate.
        if !self.homing_move(axis, sign * 2.0 * pulloff, feed_rate, true)? {
            return Err(Alarm::HomingFailApproach);
        }
        self.homing_debounce();

        self.homing_move(axis, -sign * pulloff, seek_rate, false)?;
        if self.limits.limit_state() & (1 << axis) != 0 {
            return Err(Alarm::HomingFailPulloff);
        }

        // Machine origin: the switch marks the top of travel; the axis
        // now rests one pull-off inside the workspace [-max_travel, 0].
        let rest_mm = if dir_negative {
            pulloff - self.settings.max_travel[axis]
        } else {
            -pulloff
        };
        let mut position = self.shared.position.snapshot();
        position[axis] = (rest_mm * self.settings.steps_per_mm[axis]).round() as i32;
        self.shared.position.set_all(&position);
        Ok(())
    }

    /// One homing system motion. Returns whether the limit stopped it.
    fn homing_move(
        &mut self,
        axis: usize,
        delta_mm: f32,
        rate: f32,
        stop_on_limit: bool,
    ) -> Result<bool, Alarm> {
        self.planner.sync_position(&self.shared.position.snapshot());
        let mut target = self.machine_position_mm();
        target[axis] += delta_mm;

        let pl_data = PlanLineData {
            feed_rate: rate,
            spindle_rpm: 0.0,
            condition: Condition::SYSTEM_MOTION | Condition::NO_FEED_OVERRIDE,
            line_number: 0,
        };
        match self.planner.buffer_line(&target, &pl_data, &self.settings) {
            Ok(()) => {}
            Err(PlanError::Empty) => return Ok(false),
            Err(PlanError::BufferFull) => unreachable!("system motions bypass the ring"),
        }
        self.step_control = StepControl::EXECUTE_SYS_MOTION;

        loop {
            self.prep
                .fill(&mut self.planner, &mut self.step_control, &self.settings);
            if let Some(driver) = &mut self.driver {
                driver.isr.tick(&mut driver.pins);
            }

            if self.rt_flags.state().contains(ExecState::RESET) {
                self.abort = true;
                return Err(Alarm::HomingFailReset);
            }
            if stop_on_limit && self.limits.limit_state() & (1 << axis) != 0 {
                self.flush_motion();
                return Ok(true);
            }
            if self.step_control.contains(StepControl::END_MOTION) && self.shared.is_empty() {
                self.step_control = StepControl::empty();
                self.prep.reset();
                return Ok(false);
            }
        }
    }

    fn homing_debounce(&self) {
        std::thread::sleep(Duration::from_millis(
            self.settings.homing_debounce_ms.min(50) as u64,
        ));
    }

    // ─── Jog ────────────────────────────────────────────────────────

    /// Admit a validated jog: travel-checked, planned, state to Jog.
    pub fn jog_execute(&mut self, target: &[f32; N_AXIS], feed_rate: f32) -> Result<(), Status> {
        if self.settings.soft_limits && self.outside_travel(target) {
            return Err(Status::TravelExceeded);
        }
        if self.check_mode() {
            return Ok(());
        }
        let pl_data = PlanLineData {
            feed_rate,
            spindle_rpm: self.gc.spindle_speed,
            condition: Condition::empty(),
            line_number: 0,
        };
        loop {
            if self.abort {
                return Ok(());
            }
            match self.planner.buffer_line(target, &pl_data, &self.settings) {
                Ok(()) => break,
                Err(PlanError::Empty) => return Ok(()),
                Err(PlanError::BufferFull) => {
                    self.execute_realtime();
                    self.pump_motion();
                }
            }
        }
        self.state = MachineState::Jog;
        Ok(())
    }

    // ─── Kill / Flush ───────────────────────────────────────────────

    /// Immediately stop pulse generation and drop all prepared segments.
    /// Queued planner blocks survive; callers decide whether to flush.
    pub fn flush_motion(&mut self) {
        self.shared.set_halt(true);
        if let Some(driver) = &mut self.driver {
            driver.isr.reset();
        }
        // A detached tick thread observes the halt latch within one tick;
        // at worst it finishes one stale segment whose steps still land
        // in the authoritative position.
        self.shared.reset_rings();
        self.prep.reset();
        self.shared.set_halt(false);
        self.step_control = StepControl::empty();
    }

    /// Kill motion and abandon the plan. Position shadows resync from the
    /// authoritative step count.
    pub fn mc_reset(&mut self) {
        self.flush_motion();
        self.planner.reset_buffer();
        self.planner.sync_position(&self.shared.position.snapshot());
    }

    // ─── Helpers ────────────────────────────────────────────────────

    /// All queued and in-flight motion has completed.
    pub fn motion_drained(&self) -> bool {
        self.planner.is_empty() && self.shared.is_empty() && !self.prep.has_partial_block()
    }

    fn outside_travel(&self, target: &[f32; N_AXIS]) -> bool {
        // Machine workspace is [-max_travel, 0] per axis, origin at home.
        const EPS: f32 = 1e-3;
        (0..N_AXIS).any(|axis| {
            target[axis] > EPS || target[axis] < -self.settings.max_travel[axis] - EPS
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carve_common::state::MachineState;

    fn pump_until_drained(machine: &mut Machine) {
        let mut guard = 0u32;
        while !machine.motion_drained() {
            machine.auto_cycle_start();
            machine.execute_realtime();
            machine.pump_motion();
            guard += 1;
            assert!(guard < 2_000_000, "motion failed to drain");
        }
        machine.execute_realtime();
    }

    #[test]
    fn line_scenario_emits_exact_steps() {
        let mut machine = Machine::for_tests();
        machine.gc_execute_line("G21G90G1X10F600").unwrap();
        pump_until_drained(&mut machine);
        assert_eq!(machine.steps_emitted(), [2500, 0, 0]);
        assert_eq!(machine.shared.position.snapshot(), [2500, 0, 0]);
        assert_eq!(machine.state, MachineState::Idle);
    }

    #[test]
    fn half_circle_lands_on_target_within_tolerance() {
        let mut machine = Machine::for_tests();
        machine.gc_execute_line("G2X10Y0I5J0F300").unwrap();
        pump_until_drained(&mut machine);
        let position = machine.machine_position_mm();
        assert!((position[X_AXIS] - 10.0).abs() < 0.01);
        assert!(position[Y_AXIS].abs() < 0.01);
        // The arc swept above the chord: Y must have gone negative for a
        // clockwise half-circle from 0 to 10 about (5,0).
        assert!(machine.steps_emitted()[Y_AXIS] > 0);
    }

    #[test]
    fn soft_limit_violation_raises_alarm_not_motion() {
        let mut machine = Machine::for_tests();
        machine.settings.set(22, 1.0).unwrap();
        machine.settings.set(20, 1.0).unwrap();
        machine.gc_execute_line("G0X50").unwrap();
        machine.execute_realtime();
        assert_eq!(machine.state, MachineState::Alarm);
        assert!(machine.planner.is_empty());
        assert_eq!(machine.steps_emitted(), [0, 0, 0]);
    }

    #[test]
    fn jog_travel_check_precedes_planning() {
        let mut machine = Machine::for_tests();
        machine.settings.set(22, 1.0).unwrap();
        machine.settings.set(20, 1.0).unwrap();
        let err = machine.gc_execute_line("$J=G90X50F600").unwrap_err();
        assert_eq!(err, Status::TravelExceeded);
        assert_eq!(machine.state, MachineState::Idle);
    }

    #[test]
    fn homing_establishes_origin() {
        let mut machine = Machine::for_tests();
        machine.settings.set(22, 1.0).unwrap();
        // Switches a little way up each axis.
        let mut limits = crate::machine::SimLimits::new(std::sync::Arc::clone(&machine.shared));
        limits.set_trip(X_AXIS, 800);
        limits.set_trip(Y_AXIS, 600);
        limits.set_trip(Z_AXIS, 400);
        machine.limits = Box::new(limits);

        assert!(machine.mc_homing_cycle());
        assert!(machine.homed);
        assert_eq!(machine.state, MachineState::Idle);
        // Every axis rests one pull-off inside the workspace.
        let expected = -(machine.settings.homing_pulloff
            * machine.settings.steps_per_mm[X_AXIS])
            .round() as i32;
        let position = machine.shared.position.snapshot();
        assert_eq!(position, [expected; N_AXIS]);
        assert_eq!(machine.gc.position, machine.machine_position_mm());
    }

    #[test]
    fn homing_without_switch_fails_approach() {
        let mut machine = Machine::for_tests();
        machine.settings.set(22, 1.0).unwrap();
        // No trips configured: the Z seek runs out of travel.
        assert!(!machine.mc_homing_cycle());
        machine.execute_realtime();
        assert_eq!(machine.state, MachineState::Alarm);
    }

    #[test]
    fn probe_toward_records_contact() {
        let mut machine = Machine::for_tests();
        let mut probe = crate::machine::SimProbe::new(std::sync::Arc::clone(&machine.shared));
        probe.set_trip(X_AXIS, 500);
        machine.probe = Box::new(probe);

        machine.gc_execute_line("G38.2X5F300").unwrap();
        assert!(machine.probe_succeeded);
        // Contact at 2 mm, well short of the 5 mm target.
        assert!(machine.probe_position[X_AXIS] >= 500);
        assert!(machine.probe_position[X_AXIS] < 1250);
        // Shadow re-read from the authoritative count, not the target.
        assert_eq!(machine.gc.position, machine.machine_position_mm());
        assert_eq!(machine.state, MachineState::Idle);
    }

    #[test]
    fn probe_miss_raises_alarm() {
        let mut machine = Machine::for_tests();
        machine.gc_execute_line("G38.2X5F300").unwrap();
        machine.execute_realtime();
        assert_eq!(machine.state, MachineState::Alarm);
        assert!(!machine.probe_succeeded);
    }

    #[test]
    fn probe_no_error_variant_reports_without_alarm() {
        let mut machine = Machine::for_tests();
        machine.gc_execute_line("G38.3X2F300").unwrap();
        machine.execute_realtime();
        assert_eq!(machine.state, MachineState::Idle);
        assert!(!machine.probe_succeeded);
    }
}

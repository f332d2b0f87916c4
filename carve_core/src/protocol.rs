//! Protocol loop and realtime executor.
//!
//! The main loop assembles serial bytes into lines and dispatches them;
//! between reads, and at every checkpoint inside long motions, the
//! realtime executor drains the flag mailbox and drives the machine
//! state transitions: cycle, hold, jog, cancel, alarm, sleep, overrides.

use carve_common::alarm::Alarm;
use carve_common::consts::{
    FEED_OVERRIDE_COARSE, FEED_OVERRIDE_FINE, FEED_OVERRIDE_MAX, FEED_OVERRIDE_MIN,
    MAX_LINE_LENGTH, N_STARTUP_LINES, RAPID_OVERRIDE_DEFAULT, RAPID_OVERRIDE_LOW,
    RAPID_OVERRIDE_MEDIUM,
};
use carve_common::nvs;
use carve_common::state::{ExecOverride, ExecState, MachineState, StepControl, Suspend};
use carve_common::status::Status;
use tracing::{debug, info};

use crate::gcode::{ModalState, MotionMode};
use crate::machine::Machine;
use crate::report;

// The assembler buffer must hold any storable startup line.
static_assertions::const_assert!(MAX_LINE_LENGTH >= 64);

impl Machine {
    /// Firmware entry point: run until the transport closes. A soft
    /// reset unwinds to here, re-initialises, and keeps serving.
    pub fn run(&mut self) {
        info!("protocol loop starting");
        loop {
            report::welcome(self.transport.as_mut());

            // Startup lines execute only from a clean idle boot.
            if self.state == MachineState::Idle {
                self.run_startup_lines();
            }

            if !self.main_loop() {
                info!("transport closed, shutting down");
                return;
            }
            self.reset_machine();
        }
    }

    fn run_startup_lines(&mut self) {
        for n in 0..N_STARTUP_LINES {
            match nvs::load_startup_line(self.nvs.as_ref(), n) {
                Ok(line) if !line.is_empty() => {
                    self.transport.write(b">");
                    self.transport.write(line.as_bytes());
                    self.transport.write(b":");
                    let result = self.gc_execute_line(&line);
                    report::status(self.transport.as_mut(), result);
                }
                _ => {}
            }
        }
    }

    /// Line assembly and dispatch. Returns `true` on soft reset (caller
    /// re-initialises), `false` when the transport is gone.
    fn main_loop(&mut self) -> bool {
        let mut line: heapless::Vec<u8, MAX_LINE_LENGTH> = heapless::Vec::new();
        let mut in_paren_comment = false;
        let mut in_semi_comment = false;
        let mut overflow = false;

        loop {
            while let Some(byte) = self.transport.read_byte() {
                match byte {
                    b'\n' | b'\r' => {
                        if overflow {
                            report::status(self.transport.as_mut(), Err(Status::Overflow));
                        } else {
                            let text = String::from_utf8_lossy(&line).into_owned();
                            let result = self.execute_line(&text);
                            report::status(self.transport.as_mut(), result);
                        }
                        line.clear();
                        in_paren_comment = false;
                        in_semi_comment = false;
                        overflow = false;

                        self.execute_realtime();
                        if self.abort {
                            return true;
                        }
                        self.auto_cycle_start();
                    }
                    b'(' => in_paren_comment = true,
                    b')' => in_paren_comment = false,
                    b';' => in_semi_comment = true,
                    b' ' | b'\t' => {}
                    _ if in_paren_comment || in_semi_comment => {}
                    _ if byte < 0x20 => {}
                    _ => {
                        if line.push(byte.to_ascii_uppercase()).is_err() {
                            overflow = true;
                        }
                    }
                }
            }

            self.execute_realtime();
            if self.abort {
                return true;
            }
            self.auto_cycle_start();
            self.pump_motion();

            if self.transport.is_closed() && line.is_empty() {
                if self.motion_drained() {
                    return false;
                }
            } else if self.motion_drained() {
                // Nothing to do: yield instead of spinning.
                std::thread::sleep(std::time::Duration::from_micros(500));
            }
        }
    }

    /// Dispatch one assembled line: `$` system surface or g-code, with
    /// the alarm/sleep/jog lockout for the latter.
    pub fn execute_line(&mut self, text: &str) -> Result<(), Status> {
        if text.is_empty() {
            return Ok(());
        }
        if let Some(rest) = text.strip_prefix('$') {
            if text.starts_with("$J=") {
                if !matches!(self.state, MachineState::Idle | MachineState::Jog) {
                    return Err(Status::IdleError);
                }
                return self.gc_execute_line(text);
            }
            return self.execute_system_line(rest);
        }
        match self.state {
            MachineState::Alarm | MachineState::Sleep | MachineState::Jog => {
                Err(Status::SystemGcLock)
            }
            _ => self.gc_execute_line(text),
        }
    }

    // ─── Realtime Executor ──────────────────────────────────────────

    /// Drain the realtime mailbox and apply state transitions. Called
    /// between line reads and at every motion checkpoint.
    pub fn execute_realtime(&mut self) {
        if self.abort {
            return;
        }

        // Hard-limit poll: the hosted stand-in for the pin-change
        // interrupt. Homing manages its own switch contact.
        if self.settings.hard_limits
            && self.state.is_motion_state()
            && self.state != MachineState::Homing
            && self.limits.limit_state() != 0
        {
            self.mc_reset();
            self.rt_flags.set_alarm(Alarm::HardLimit);
        }

        if let Some(alarm) = self.rt_flags.take_alarm() {
            self.state = MachineState::Alarm;
            report::alarm_message(self.transport.as_mut(), alarm);
            if alarm.position_lost() {
                report::feedback(self.transport.as_mut(), "Reset to continue");
            }
        }

        let rt = self.rt_flags.take_state();
        if rt.contains(ExecState::RESET) {
            self.abort = true;
            return;
        }
        if rt.contains(ExecState::STATUS_REPORT) {
            self.report_realtime_status();
        }
        if rt.contains(ExecState::SLEEP)
            && matches!(self.state, MachineState::Idle | MachineState::Alarm)
        {
            self.state = MachineState::Sleep;
            report::feedback(self.transport.as_mut(), "Sleeping");
        }

        if rt.contains(ExecState::FEED_HOLD) {
            self.initiate_hold(Suspend::empty());
        }
        if rt.contains(ExecState::MOTION_CANCEL) {
            self.initiate_hold(Suspend::MOTION_CANCEL);
        }

        if rt.contains(ExecState::CYCLE_START) {
            self.handle_cycle_start();
        }
        if rt.contains(ExecState::CYCLE_STOP) {
            self.handle_cycle_stop();
        }

        let ov = self.rt_flags.take_override();
        if !ov.is_empty() {
            self.apply_overrides(ov);
        }
    }

    /// Begin a controlled deceleration. `extra_suspend` distinguishes a
    /// resumable hold from a cancel that flushes on completion.
    fn initiate_hold(&mut self, extra_suspend: Suspend) {
        match self.state {
            MachineState::Cycle => {
                debug!("feed hold: decelerating");
                self.state = MachineState::Hold;
                self.suspend = extra_suspend;
                self.step_control.insert(StepControl::EXECUTE_HOLD);
                self.prep.flag_replan(&mut self.planner);
            }
            MachineState::Jog => {
                // Any hold or cancel during a jog cancels the jog.
                self.suspend
                    .insert(Suspend::JOG_CANCEL | Suspend::MOTION_CANCEL | extra_suspend);
                self.step_control.insert(StepControl::EXECUTE_HOLD);
                self.prep.flag_replan(&mut self.planner);
            }
            _ => {}
        }
    }

    fn handle_cycle_start(&mut self) {
        match self.state {
            MachineState::Hold if self.suspend.contains(Suspend::HOLD_COMPLETE) => {
                self.suspend = Suspend::empty();
                self.step_control
                    .remove(StepControl::EXECUTE_HOLD | StepControl::END_MOTION);
                if self.planner.is_empty() && !self.prep.has_partial_block() {
                    self.state = MachineState::Idle;
                } else {
                    debug!("resuming from hold");
                    self.state = MachineState::Cycle;
                    self.planner.cycle_reinitialize();
                }
            }
            MachineState::Idle if !self.planner.is_empty() => {
                self.state = MachineState::Cycle;
            }
            _ => {}
        }
    }

    /// The stepper drained its segment ring. What that means depends on
    /// what the machine was doing.
    fn handle_cycle_stop(&mut self) {
        match self.state {
            MachineState::Hold => {
                // The deceleration finished (END_MOTION), or the hold
                // arrived with nothing left in flight to decelerate.
                if self.step_control.contains(StepControl::END_MOTION) || self.motion_drained() {
                    if self.suspend.intersects(Suspend::MOTION_CANCEL | Suspend::JOG_CANCEL) {
                        self.flush_and_resync();
                        self.suspend = Suspend::empty();
                        self.state = MachineState::Idle;
                    } else {
                        // Hold and end-motion bits stay set while parked;
                        // only the resume clears them.
                        self.suspend.insert(Suspend::HOLD_COMPLETE);
                        debug!("hold complete, parked");
                    }
                }
                // Otherwise a transient drain mid-deceleration: ignore.
            }
            MachineState::Jog => {
                if self.suspend.contains(Suspend::JOG_CANCEL) {
                    if self.step_control.contains(StepControl::END_MOTION) {
                        self.step_control
                            .remove(StepControl::EXECUTE_HOLD | StepControl::END_MOTION);
                        self.flush_and_resync();
                        self.suspend = Suspend::empty();
                        self.state = MachineState::Idle;
                        debug!("jog cancelled");
                    }
                } else if self.motion_drained() {
                    self.state = MachineState::Idle;
                }
            }
            MachineState::Cycle => {
                if self.motion_drained() {
                    self.state = MachineState::Idle;
                    self.step_control = StepControl::empty();
                }
            }
            _ => {}
        }
    }

    /// Drop prepared and queued motion and resync both position shadows
    /// from the authoritative step count.
    fn flush_and_resync(&mut self) {
        self.flush_motion();
        self.planner.reset_buffer();
        self.planner.sync_position(&self.shared.position.snapshot());
        self.gc.position = self.machine_position_mm();
    }

    fn apply_overrides(&mut self, ov: ExecOverride) {
        let mut feed = self.planner.feed_override() as i16;
        if ov.contains(ExecOverride::FEED_RESET) {
            feed = 100;
        }
        if ov.contains(ExecOverride::FEED_COARSE_PLUS) {
            feed += FEED_OVERRIDE_COARSE as i16;
        }
        if ov.contains(ExecOverride::FEED_COARSE_MINUS) {
            feed -= FEED_OVERRIDE_COARSE as i16;
        }
        if ov.contains(ExecOverride::FEED_FINE_PLUS) {
            feed += FEED_OVERRIDE_FINE as i16;
        }
        if ov.contains(ExecOverride::FEED_FINE_MINUS) {
            feed -= FEED_OVERRIDE_FINE as i16;
        }
        let feed = feed.clamp(FEED_OVERRIDE_MIN as i16, FEED_OVERRIDE_MAX as i16) as u8;

        let mut rapid = self.planner.rapid_override();
        if ov.contains(ExecOverride::RAPID_RESET) {
            rapid = RAPID_OVERRIDE_DEFAULT;
        }
        if ov.contains(ExecOverride::RAPID_MEDIUM) {
            rapid = RAPID_OVERRIDE_MEDIUM;
        }
        if ov.contains(ExecOverride::RAPID_LOW) {
            rapid = RAPID_OVERRIDE_LOW;
        }

        self.planner.set_overrides(feed, rapid);
    }

    // ─── Flow Helpers ───────────────────────────────────────────────

    /// Kick the stepper whenever planned motion is waiting on an idle
    /// machine.
    pub fn auto_cycle_start(&mut self) {
        if !self.planner.is_empty() && self.state == MachineState::Idle {
            self.rt_flags.set_state(ExecState::CYCLE_START);
            self.execute_realtime();
        }
    }

    /// Block until every queued block and segment has executed. The
    /// realtime executor keeps running at each wait step.
    pub fn buffer_synchronize(&mut self) {
        while !self.abort && !self.motion_drained() {
            self.auto_cycle_start();
            self.execute_realtime();
            self.pump_motion();
        }
        self.execute_realtime();
    }

    /// M0: park until cycle start.
    pub(crate) fn program_pause(&mut self) {
        if self.check_mode() {
            return;
        }
        debug!("program pause");
        self.state = MachineState::Hold;
        self.suspend = Suspend::HOLD_COMPLETE;
        while self.state == MachineState::Hold && !self.abort {
            self.execute_realtime();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// M2/M30: program end — overrides restored, modal groups to their
    /// program defaults, G54 reloaded.
    pub(crate) fn program_end(&mut self) {
        if !self.check_mode() {
            self.planner.set_overrides(100, 100);
        }
        let units = self.gc.modal.units;
        self.gc.modal = ModalState {
            motion: MotionMode::Linear,
            units,
            ..ModalState::default()
        };
        if let Ok(data) = nvs::load_coord_data(self.nvs.as_mut(), 0) {
            self.gc.coord_system = data;
        }
        report::feedback(self.transport.as_mut(), "Pgm End");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carve_common::consts::X_AXIS;

    fn pump_n(machine: &mut Machine, n: usize) {
        for _ in 0..n {
            machine.execute_realtime();
            machine.pump_motion();
        }
    }

    fn pump_until_drained(machine: &mut Machine) {
        let mut guard = 0u32;
        while !machine.motion_drained() || machine.state.is_motion_state() {
            machine.auto_cycle_start();
            machine.execute_realtime();
            machine.pump_motion();
            guard += 1;
            assert!(guard < 3_000_000, "pipeline failed to drain");
            if machine.state == MachineState::Hold {
                break;
            }
        }
        machine.execute_realtime();
    }

    #[test]
    fn hold_and_resume_completes_motion() {
        let mut machine = Machine::for_tests();
        machine.execute_line("G1X100F1000").unwrap();
        machine.auto_cycle_start();
        assert_eq!(machine.state, MachineState::Cycle);

        // Let it move, then hold mid-travel.
        pump_n(&mut machine, 3000);
        let at_hold_request = machine.shared.position.snapshot()[X_AXIS];
        assert!(at_hold_request > 0);
        assert!(at_hold_request < 25_000);

        machine.rt_flags.set_state(ExecState::FEED_HOLD);
        let mut guard = 0;
        while !machine.suspend.contains(Suspend::HOLD_COMPLETE) {
            machine.execute_realtime();
            machine.pump_motion();
            guard += 1;
            assert!(guard < 2_000_000, "hold never completed");
        }
        assert_eq!(machine.state, MachineState::Hold);
        let parked = machine.shared.position.snapshot()[X_AXIS];
        assert!(parked < 25_000, "hold must stop short of target");

        // Resume and run to completion.
        machine.rt_flags.set_state(ExecState::CYCLE_START);
        machine.execute_realtime();
        assert_eq!(machine.state, MachineState::Cycle);
        pump_until_drained(&mut machine);
        assert_eq!(machine.shared.position.snapshot(), [25_000, 0, 0]);
        assert_eq!(machine.state, MachineState::Idle);
    }

    #[test]
    fn jog_cancel_stops_between_origin_and_target() {
        let mut machine = Machine::for_tests();
        machine.execute_line("$J=G91X5F1000").unwrap();
        assert_eq!(machine.state, MachineState::Jog);

        pump_n(&mut machine, 400);
        let mid = machine.shared.position.snapshot()[X_AXIS];
        assert!(mid > 0);

        // 0x85 jog cancel.
        machine.rt_flags.set_state(ExecState::MOTION_CANCEL);
        let mut guard = 0;
        while machine.state == MachineState::Jog {
            machine.execute_realtime();
            machine.pump_motion();
            guard += 1;
            assert!(guard < 2_000_000, "jog cancel never completed");
        }
        assert_eq!(machine.state, MachineState::Idle);
        let stopped = machine.shared.position.snapshot()[X_AXIS];
        assert!(stopped > 0 && stopped < 1250, "position strictly inside jog");
        // Rings flushed, parser resynced to where the machine stopped.
        assert!(machine.planner.is_empty());
        assert!(machine.shared.is_empty());
        assert!((machine.gc.position[X_AXIS] - machine.machine_position_mm()[X_AXIS]).abs() < 1e-6);
    }

    #[test]
    fn three_collinear_moves_keep_junctions_open() {
        let mut machine = Machine::for_tests();
        machine.execute_line("G91G1X1F100").unwrap();
        machine.execute_line("G1X1").unwrap();
        machine.execute_line("G1X1").unwrap();
        assert_eq!(machine.planner.block_count(), 3);
        // The middle block enters at speed: its entry is the first
        // block's exit, non-zero under collinear continuation.
        assert!(machine.planner.exec_block_exit_speed_sqr() > 0.0);

        pump_until_drained(&mut machine);
        assert_eq!(machine.shared.position.snapshot(), [750, 0, 0]);
    }

    #[test]
    fn hard_limit_mid_cycle_alarms_and_locks() {
        let mut machine = Machine::for_tests();
        machine.settings.set(21, 1.0).unwrap();
        let mut limits = crate::machine::SimLimits::new(std::sync::Arc::clone(&machine.shared));
        limits.set_trip(X_AXIS, 300);
        machine.limits = Box::new(limits);

        machine.execute_line("G1X10F600").unwrap();
        machine.auto_cycle_start();
        let mut guard = 0;
        while machine.state != MachineState::Alarm {
            machine.execute_realtime();
            machine.pump_motion();
            guard += 1;
            assert!(guard < 2_000_000, "hard limit never tripped");
        }
        // Motion killed promptly after the trip.
        assert!(machine.shared.is_empty());
        assert!(machine.planner.is_empty());
        // Non-$ lines are locked out.
        assert_eq!(
            machine.execute_line("G0X1"),
            Err(Status::SystemGcLock)
        );
        // $ commands still answer.
        assert!(machine.execute_line("$G").is_ok());
    }

    #[test]
    fn feed_override_applies_and_clamps() {
        let mut machine = Machine::for_tests();
        machine.rt_flags.set_override(ExecOverride::FEED_COARSE_MINUS);
        machine.execute_realtime();
        assert_eq!(machine.planner.feed_override(), 90);
        for _ in 0..20 {
            machine.rt_flags.set_override(ExecOverride::FEED_COARSE_MINUS);
            machine.execute_realtime();
        }
        assert_eq!(machine.planner.feed_override(), FEED_OVERRIDE_MIN);
        machine.rt_flags.set_override(ExecOverride::FEED_RESET);
        machine.execute_realtime();
        assert_eq!(machine.planner.feed_override(), 100);

        machine.rt_flags.set_override(ExecOverride::RAPID_LOW);
        machine.execute_realtime();
        assert_eq!(machine.planner.rapid_override(), RAPID_OVERRIDE_LOW);
    }

    #[test]
    fn soft_reset_mid_cycle_enters_alarm() {
        let mut machine = Machine::for_tests();
        machine.execute_line("G1X50F1000").unwrap();
        machine.auto_cycle_start();
        pump_n(&mut machine, 1000);
        assert_eq!(machine.state, MachineState::Cycle);

        machine.rt_flags.set_state(ExecState::RESET);
        machine.execute_realtime();
        assert!(machine.abort);
        machine.reset_machine();
        // Reset mid-motion: position cannot be trusted.
        assert_eq!(machine.state, MachineState::Alarm);
        assert!(machine.planner.is_empty());
        // Parser shadow resynced to wherever the machine stopped.
        assert!((machine.gc.position[X_AXIS] - machine.machine_position_mm()[X_AXIS]).abs() < 1e-6);
    }
}

//! `$` system-command surface.
//!
//! Settings access, info reports, homing, check-mode, unlock, sleep,
//! restore, and jog admission all arrive here. Commands that touch the
//! non-volatile store or machine state are gated on an idle (or alarmed)
//! machine; the planner is drained by construction at that point.

use carve_common::consts::N_AXIS;
use carve_common::nvs::{self, N_COORDINATE_DATA};
use carve_common::settings::Settings;
use carve_common::state::{ExecState, MachineState};
use carve_common::status::Status;
use tracing::info;

use crate::machine::Machine;
use crate::report;

impl Machine {
    /// Execute a `$` line; `rest` is everything after the `$`.
    pub fn execute_system_line(&mut self, rest: &str) -> Result<(), Status> {
        match rest {
            "" => {
                report::help(self.transport.as_mut());
                return Ok(());
            }
            "$" => {
                report::settings_list(self.transport.as_mut(), &self.settings);
                return Ok(());
            }
            "G" => {
                self.report_gcode_modes();
                return Ok(());
            }
            "I" => {
                self.report_build_info();
                return Ok(());
            }
            "#" => {
                self.require_idle_or_alarm()?;
                return self.report_coordinate_tables();
            }
            "N" => {
                self.require_idle_or_alarm()?;
                return self.report_startup_lines();
            }
            "H" => return self.system_homing(),
            "C" => return self.system_toggle_check_mode(),
            "X" => {
                if self.state == MachineState::Alarm {
                    report::feedback(self.transport.as_mut(), "Caution: Unlocked");
                    self.state = MachineState::Idle;
                    info!("alarm unlocked");
                }
                return Ok(());
            }
            "SLP" => {
                self.require_idle_or_alarm()?;
                self.rt_flags.set_state(ExecState::SLEEP);
                return Ok(());
            }
            _ => {}
        }

        if let Some(suffix) = rest.strip_prefix("RST=") {
            return self.system_restore(suffix);
        }
        if let Some(line) = rest.strip_prefix("N0=") {
            return self.store_startup_line(0, line);
        }
        if let Some(line) = rest.strip_prefix("N1=") {
            return self.store_startup_line(1, line);
        }
        if let Some(info_text) = rest.strip_prefix("I=") {
            self.require_idle_or_alarm()?;
            if !nvs::store_build_info(self.nvs.as_mut(), info_text)
                .map_err(|_| Status::SettingReadFail)?
            {
                return Err(Status::LineLengthExceeded);
            }
            return Ok(());
        }

        self.system_write_setting(rest)
    }

    fn require_idle_or_alarm(&self) -> Result<(), Status> {
        match self.state {
            MachineState::Idle | MachineState::Alarm => Ok(()),
            _ => Err(Status::IdleError),
        }
    }

    /// `$<n>=<v>` setting write.
    fn system_write_setting(&mut self, rest: &str) -> Result<(), Status> {
        let (number_text, value_text) =
            rest.split_once('=').ok_or(Status::InvalidStatement)?;
        let number: u32 = number_text
            .parse()
            .map_err(|_| Status::InvalidStatement)?;
        let value: f32 = value_text
            .parse()
            .map_err(|_| Status::BadNumberFormat)?;

        self.require_idle_or_alarm()?;
        self.settings.set(number, value)?;
        self.settings
            .save(self.nvs.as_mut())
            .map_err(|_| Status::SettingReadFail)?;
        Ok(())
    }

    /// `$H` homing cycle.
    fn system_homing(&mut self) -> Result<(), Status> {
        if !self.settings.homing_enable {
            return Err(Status::SettingDisabled);
        }
        self.require_idle_or_alarm()?;
        self.mc_homing_cycle();
        Ok(())
    }

    /// `$C` check-mode toggle. Leaving check mode resets the machine so
    /// no dry-run state leaks into real execution.
    fn system_toggle_check_mode(&mut self) -> Result<(), Status> {
        if self.check_mode() {
            report::feedback(self.transport.as_mut(), "Disabled");
            self.reset_machine();
        } else {
            if self.state != MachineState::Idle {
                return Err(Status::IdleError);
            }
            self.state = MachineState::CheckMode;
            report::feedback(self.transport.as_mut(), "Enabled");
        }
        Ok(())
    }

    /// `$RST=*` / `$RST=$` / `$RST=#` restores.
    fn system_restore(&mut self, suffix: &str) -> Result<(), Status> {
        self.require_idle_or_alarm()?;
        match suffix {
            "$" => self.restore_settings()?,
            "#" => self.restore_parameters()?,
            "*" => {
                self.restore_settings()?;
                self.restore_parameters()?;
                for n in 0..carve_common::consts::N_STARTUP_LINES {
                    let _ = nvs::store_startup_line(self.nvs.as_mut(), n, "");
                }
                let _ = nvs::store_build_info(self.nvs.as_mut(), "");
            }
            _ => return Err(Status::InvalidStatement),
        }
        report::feedback(self.transport.as_mut(), "Restoring defaults");
        Ok(())
    }

    fn restore_settings(&mut self) -> Result<(), Status> {
        self.settings = Settings::default();
        self.settings
            .save(self.nvs.as_mut())
            .map_err(|_| Status::SettingReadFail)
    }

    fn restore_parameters(&mut self) -> Result<(), Status> {
        let zero = [0.0f32; N_AXIS];
        for slot in 0..N_COORDINATE_DATA {
            nvs::store_coord_data(self.nvs.as_mut(), slot, &zero)
                .map_err(|_| Status::SettingReadFail)?;
        }
        self.gc.coord_system = zero;
        self.gc.coord_offset = zero;
        Ok(())
    }

    /// `$N<n>=<line>` store a startup line.
    fn store_startup_line(&mut self, n: usize, line: &str) -> Result<(), Status> {
        self.require_idle_or_alarm()?;
        // System commands cannot be startup lines.
        if line.contains('$') {
            return Err(Status::InvalidStatement);
        }
        if !nvs::store_startup_line(self.nvs.as_mut(), n, line)
            .map_err(|_| Status::SettingReadFail)?
        {
            return Err(Status::LineLengthExceeded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_write_read_roundtrip() {
        let mut machine = Machine::for_tests();
        machine.execute_line("$11=0.025").unwrap();
        assert_eq!(machine.settings.junction_deviation, 0.025);
        assert_eq!(machine.settings.get(11), Some(0.025));
        // Persisted: reload from the store.
        let loaded = Settings::load(machine.nvs.as_ref()).unwrap();
        assert_eq!(loaded.junction_deviation, 0.025);
    }

    #[test]
    fn setting_write_propagates_validation() {
        let mut machine = Machine::for_tests();
        assert_eq!(
            machine.execute_line("$0=1"),
            Err(Status::SettingStepPulseMin)
        );
        assert_eq!(
            machine.execute_line("$999=1"),
            Err(Status::InvalidStatement)
        );
        assert_eq!(
            machine.execute_line("$11=abc"),
            Err(Status::BadNumberFormat)
        );
    }

    #[test]
    fn unlock_clears_alarm() {
        let mut machine = Machine::for_tests();
        machine.state = MachineState::Alarm;
        assert_eq!(machine.execute_line("G0X1"), Err(Status::SystemGcLock));
        machine.execute_line("$X").unwrap();
        assert_eq!(machine.state, MachineState::Idle);
        machine.execute_line("G0X1").unwrap();
    }

    #[test]
    fn settings_allowed_in_alarm_but_not_in_cycle() {
        let mut machine = Machine::for_tests();
        machine.state = MachineState::Alarm;
        machine.execute_line("$11=0.02").unwrap();
        machine.state = MachineState::Cycle;
        assert_eq!(machine.execute_line("$11=0.03"), Err(Status::IdleError));
    }

    #[test]
    fn homing_requires_enable_setting() {
        let mut machine = Machine::for_tests();
        assert_eq!(machine.execute_line("$H"), Err(Status::SettingDisabled));
    }

    #[test]
    fn check_mode_dry_runs_without_motion() {
        let mut machine = Machine::for_tests();
        machine.execute_line("$C").unwrap();
        assert!(machine.check_mode());
        machine.execute_line("G1X10F600").unwrap();
        assert!(machine.planner.is_empty());
        assert_eq!(machine.steps_emitted(), [0, 0, 0]);
        // Bad lines still validate.
        assert_eq!(
            machine.execute_line("G1X5X6F100"),
            Err(Status::WordRepeated)
        );
        // Leaving check mode resets the dry-run position shadow.
        machine.execute_line("$C").unwrap();
        assert!(!machine.check_mode());
        assert_eq!(machine.gc.position, [0.0; N_AXIS]);
    }

    #[test]
    fn restore_parameters_zeroes_tables() {
        let mut machine = Machine::for_tests();
        machine.execute_line("G10L2P2X5Y6Z7").unwrap();
        machine.execute_line("$RST=#").unwrap();
        let data = nvs::load_coord_data(machine.nvs.as_mut(), 1).unwrap();
        assert_eq!(data, [0.0; N_AXIS]);
    }

    #[test]
    fn restore_settings_back_to_defaults() {
        let mut machine = Machine::for_tests();
        machine.execute_line("$11=0.05").unwrap();
        machine.execute_line("$RST=$").unwrap();
        assert_eq!(machine.settings, Settings::default());
        let loaded = Settings::load(machine.nvs.as_ref()).unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn startup_line_store_and_report() {
        let mut machine = Machine::for_tests();
        machine.execute_line("$N0=G21G90").unwrap();
        assert_eq!(
            nvs::load_startup_line(machine.nvs.as_ref(), 0).unwrap(),
            "G21G90"
        );
        assert_eq!(
            machine.execute_line("$N0=$H"),
            Err(Status::InvalidStatement)
        );
    }

    #[test]
    fn sleep_locks_out_gcode() {
        let mut machine = Machine::for_tests();
        machine.execute_line("$SLP").unwrap();
        machine.execute_realtime();
        assert_eq!(machine.state, MachineState::Sleep);
        assert_eq!(machine.execute_line("G0X1"), Err(Status::SystemGcLock));
    }
}

//! Response and status-report formatting.
//!
//! Every response goes through the transport contract: `ok`/`error:<n>`
//! per line, `ALARM:<n>` out of band, bracketed feedback messages, and
//! the `<…>`-framed realtime status frame.

use carve_common::alarm::Alarm;
use carve_common::consts::{MM_PER_INCH, N_AXIS, N_STARTUP_LINES};
use carve_common::nvs::{self, COORD_G28, COORD_G30};
use carve_common::settings::Settings;
use carve_common::status::Status;
use carve_motion::position::steps_to_mm;

use crate::gcode::{
    CoolantState, DistanceMode, FeedRateMode, MotionMode, SpindleState, UnitsMode,
};
use crate::machine::Machine;
use crate::serial::Transport;

const FIRMWARE_NAME: &str = "Carve";
const FIRMWARE_VERSION: &str = "1.1";

/// Power-up / reset banner.
pub fn welcome(transport: &mut dyn Transport) {
    let banner = format!("\r\n{FIRMWARE_NAME} {FIRMWARE_VERSION} ['$' for help]\r\n");
    transport.write(banner.as_bytes());
}

/// Per-line response: `ok` or `error:<n>`.
pub fn status(transport: &mut dyn Transport, result: Result<(), Status>) {
    match result {
        Ok(()) => transport.write(b"ok\r\n"),
        Err(code) => {
            let line = format!("error:{}\r\n", code.code());
            transport.write(line.as_bytes());
        }
    }
}

/// Out-of-band alarm report.
pub fn alarm_message(transport: &mut dyn Transport, alarm: Alarm) {
    let line = format!("ALARM:{}\r\n", alarm.code());
    transport.write(line.as_bytes());
}

/// Bracketed feedback message.
pub fn feedback(transport: &mut dyn Transport, message: &str) {
    let line = format!("[MSG:{message}]\r\n");
    transport.write(line.as_bytes());
}

/// `$` help summary.
pub fn help(transport: &mut dyn Transport) {
    transport.write(b"[HLP:$$ $# $G $I $N $x=val $RST $J=line $SLP $C $X $H ~ ! ? ctrl-x]\r\n");
}

/// `$$` settings dump.
pub fn settings_list(transport: &mut dyn Transport, settings: &Settings) {
    for (number, value) in settings.entries() {
        let line = format!("${}={}\r\n", number, fmt_value(value));
        transport.write(line.as_bytes());
    }
}

/// Settings print like integers when they are integers.
fn fmt_value(value: f32) -> String {
    if value.fract() == 0.0 && value.abs() < 1.0e7 {
        format!("{}", value as i64)
    } else {
        format!("{value:.3}")
    }
}

fn fmt_axes(values: &[f32; N_AXIS], inches: bool) -> String {
    let scale = if inches { 1.0 / MM_PER_INCH } else { 1.0 };
    let parts: Vec<String> = values.iter().map(|v| format!("{:.3}", v * scale)).collect();
    parts.join(",")
}

impl Machine {
    /// `?` status frame.
    pub fn report_realtime_status(&mut self) {
        let inches = self.settings.report_inches;
        let mpos = self.machine_position_mm();
        let mut wco = [0.0f32; N_AXIS];
        for axis in 0..N_AXIS {
            wco[axis] = self.gc.work_offset(axis);
        }

        let mut frame = format!("<{}", self.state.label());
        if self.settings.status_report_mask & 0x01 != 0 {
            frame.push_str(&format!("|MPos:{}", fmt_axes(&mpos, inches)));
        } else {
            let mut wpos = [0.0f32; N_AXIS];
            for axis in 0..N_AXIS {
                wpos[axis] = mpos[axis] - wco[axis];
            }
            frame.push_str(&format!("|WPos:{}", fmt_axes(&wpos, inches)));
        }
        if self.settings.status_report_mask & 0x02 != 0 {
            frame.push_str(&format!(
                "|Bf:{},{}",
                carve_common::consts::PLANNER_RING_CAPACITY - 1 - self.planner.block_count(),
                carve_common::consts::SEGMENT_RING_CAPACITY - 1 - self.shared.segment_count()
            ));
        }
        frame.push_str(&format!(
            "|FS:{:.0},{:.0}",
            self.prep.current_speed(),
            self.gc.spindle_speed
        ));
        frame.push_str(&format!("|WCO:{}", fmt_axes(&wco, inches)));
        frame.push_str(&format!(
            "|Ov:{},{},100",
            self.planner.feed_override(),
            self.planner.rapid_override()
        ));
        frame.push_str(">\r\n");
        self.transport.write(frame.as_bytes());
    }

    /// `$G` parser modal report.
    pub fn report_gcode_modes(&mut self) {
        let modal = &self.gc.modal;
        let motion = match modal.motion {
            MotionMode::Seek => "G0",
            MotionMode::Linear => "G1",
            MotionMode::CwArc => "G2",
            MotionMode::CcwArc => "G3",
            MotionMode::ProbeToward => "G38.2",
            MotionMode::ProbeTowardNoError => "G38.3",
            MotionMode::ProbeAway => "G38.4",
            MotionMode::ProbeAwayNoError => "G38.5",
            MotionMode::None => "G80",
        };
        let units = match modal.units {
            UnitsMode::Mm => "G21",
            UnitsMode::Inches => "G20",
        };
        let distance = match modal.distance {
            DistanceMode::Absolute => "G90",
            DistanceMode::Incremental => "G91",
        };
        let feed_mode = match modal.feed_rate_mode {
            FeedRateMode::UnitsPerMin => "G94",
            FeedRateMode::InverseTime => "G93",
        };
        let spindle = match modal.spindle {
            SpindleState::Disable => "M5",
            SpindleState::Cw => "M3",
            SpindleState::Ccw => "M4",
        };
        let coolant = if modal.coolant.contains(CoolantState::FLOOD) {
            "M8"
        } else if modal.coolant.contains(CoolantState::MIST) {
            "M7"
        } else {
            "M9"
        };
        let line = format!(
            "[GC:{} G{} G17 {} {} {} {} {} T{} F{} S{}]\r\n",
            motion,
            54 + modal.coord_select,
            units,
            distance,
            feed_mode,
            spindle,
            coolant,
            self.gc.tool,
            fmt_value(self.gc.feed_rate),
            fmt_value(self.gc.spindle_speed),
        );
        self.transport.write(line.as_bytes());
    }

    /// `$#` coordinate tables, G92 offset, tool offset, probe record.
    pub fn report_coordinate_tables(&mut self) -> Result<(), Status> {
        let inches = self.settings.report_inches;
        for slot in 0..=5usize {
            let data = nvs::load_coord_data(self.nvs.as_mut(), slot)
                .map_err(|_| Status::SettingReadFail)?;
            let line = format!("[G{}:{}]\r\n", 54 + slot, fmt_axes(&data, inches));
            self.transport.write(line.as_bytes());
        }
        for (label, slot) in [("G28", COORD_G28), ("G30", COORD_G30)] {
            let data = nvs::load_coord_data(self.nvs.as_mut(), slot)
                .map_err(|_| Status::SettingReadFail)?;
            let line = format!("[{label}:{}]\r\n", fmt_axes(&data, inches));
            self.transport.write(line.as_bytes());
        }
        let g92 = format!("[G92:{}]\r\n", fmt_axes(&self.gc.coord_offset, inches));
        self.transport.write(g92.as_bytes());
        let tlo = format!("[TLO:{:.3}]\r\n", self.gc.tool_length_offset);
        self.transport.write(tlo.as_bytes());
        self.report_probe_result();
        Ok(())
    }

    /// `[PRB:...]` probe record.
    pub(crate) fn report_probe_result(&mut self) {
        let mm = steps_to_mm(&self.probe_position, &self.settings.steps_per_mm);
        let line = format!(
            "[PRB:{}:{}]\r\n",
            fmt_axes(&mm, self.settings.report_inches),
            self.probe_succeeded as u8
        );
        self.transport.write(line.as_bytes());
    }

    /// `$I` build info.
    pub fn report_build_info(&mut self) {
        let stored = nvs::load_build_info(self.nvs.as_ref()).unwrap_or_default();
        let line = format!("[VER:{FIRMWARE_VERSION}:{stored}]\r\n[OPT:V]\r\n");
        self.transport.write(line.as_bytes());
    }

    /// `$N` stored startup lines.
    pub fn report_startup_lines(&mut self) -> Result<(), Status> {
        for n in 0..N_STARTUP_LINES {
            let stored = nvs::load_startup_line(self.nvs.as_ref(), n)
                .map_err(|_| Status::SettingReadFail)?;
            let line = format!("$N{n}={stored}\r\n");
            self.transport.write(line.as_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmt_value_integral_and_fractional() {
        assert_eq!(fmt_value(250.0), "250");
        assert_eq!(fmt_value(0.01), "0.010");
        assert_eq!(fmt_value(0.0), "0");
    }

    #[test]
    fn fmt_axes_inch_scaling() {
        let mm = [25.4, 0.0, -50.8];
        assert_eq!(fmt_axes(&mm, false), "25.400,0.000,-50.800");
        assert_eq!(fmt_axes(&mm, true), "1.000,0.000,-2.000");
    }

    #[test]
    fn status_formats_wire_codes() {
        let rt = std::sync::Arc::new(carve_common::state::RtFlags::new());
        let (mut transport, handle) = crate::serial::LoopbackTransport::pair(rt);
        status(&mut transport, Ok(()));
        status(&mut transport, Err(Status::ModalGroupViolation));
        alarm_message(&mut transport, Alarm::HardLimit);
        let output = handle.take_output();
        assert_eq!(output, "ok\r\nerror:21\r\nALARM:1\r\n");
    }

    #[test]
    fn realtime_status_frame_shape() {
        let mut machine = Machine::for_tests();
        let (transport, handle) =
            crate::serial::LoopbackTransport::pair(std::sync::Arc::clone(&machine.rt_flags));
        machine.transport = Box::new(transport);
        machine.report_realtime_status();
        let output = handle.take_output();
        assert!(output.starts_with("<Idle|MPos:0.000,0.000,0.000"));
        assert!(output.contains("|FS:0,0"));
        assert!(output.contains("|WCO:0.000,0.000,0.000"));
        assert!(output.contains("|Ov:100,100,100"));
        assert!(output.trim_end().ends_with('>'));
    }
}

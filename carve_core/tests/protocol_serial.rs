//! End-to-end serial scenarios: bytes in over the loopback link, the
//! protocol loop runs to completion, responses and machine state out.

use carve_common::state::MachineState;
use carve_core::machine::Machine;

fn run_with_input(input: &[u8]) -> (Machine, String) {
    let (mut machine, handle) = Machine::with_loopback();
    handle.inject(input);
    handle.close();
    machine.run();
    (machine, handle.take_output())
}

#[test]
fn banner_then_ok_for_simple_line() {
    let (machine, output) = run_with_input(b"G21G90G1X10F600\n");
    assert!(output.contains("Carve"));
    assert!(output.contains("ok\r\n"));
    assert!(!output.contains("error"));
    // 10 mm at 250 steps/mm, X only.
    assert_eq!(machine.shared.position.snapshot(), [2500, 0, 0]);
    assert_eq!(machine.state, MachineState::Idle);
}

#[test]
fn three_collinear_moves_three_oks() {
    let (machine, output) = run_with_input(b"G91G1X1F100\nG1X1\nG1X1\n");
    assert_eq!(output.matches("ok\r\n").count(), 3);
    assert_eq!(machine.shared.position.snapshot(), [750, 0, 0]);
}

#[test]
fn half_circle_reaches_target() {
    let (machine, output) = run_with_input(b"G2X10Y0I5J0F300\n");
    assert!(output.contains("ok\r\n"));
    let position = machine.machine_position_mm();
    assert!((position[0] - 10.0).abs() < 0.01);
    assert!(position[1].abs() < 0.01);
}

#[test]
fn status_report_byte_produces_frame() {
    let (_machine, output) = run_with_input(b"?");
    assert!(output.contains("<Idle|MPos:0.000,0.000,0.000"));
    assert!(output.contains("|Ov:100,100,100>"));
}

#[test]
fn overlong_line_reports_overflow() {
    let mut input = vec![b'G'; 120];
    input.push(b'\n');
    let (_machine, output) = run_with_input(&input);
    assert!(output.contains("error:11\r\n"));
}

#[test]
fn empty_and_comment_lines_answer_ok() {
    let (_machine, output) = run_with_input(b"\n(note)\n; trailing\n");
    assert_eq!(output.matches("ok\r\n").count(), 3);
}

#[test]
fn spaces_and_case_are_normalized() {
    let (machine, output) = run_with_input(b"g1 x2 f600\n");
    assert!(output.contains("ok\r\n"));
    assert_eq!(machine.shared.position.snapshot(), [500, 0, 0]);
}

#[test]
fn alarm_locks_gcode_until_unlock() {
    let (mut machine, handle) = Machine::with_loopback();
    machine.state = MachineState::Alarm;
    handle.inject(b"G0X1\n$X\nG0X1\n");
    handle.close();
    machine.run();
    let output = handle.take_output();
    assert!(output.contains("error:9\r\n"));
    assert!(output.contains("[MSG:Caution: Unlocked]"));
    assert_eq!(output.matches("ok\r\n").count(), 2);
    assert_eq!(machine.state, MachineState::Idle);
    assert_eq!(machine.shared.position.snapshot(), [250, 0, 0]);
}

#[test]
fn settings_roundtrip_over_serial() {
    let (machine, output) = run_with_input(b"$100=200\n$$\n");
    assert!(output.contains("$100=200\r\n"));
    assert_eq!(machine.settings.steps_per_mm[0], 200.0);
}

#[test]
fn coordinate_table_roundtrip_over_serial() {
    let (_machine, output) = run_with_input(b"G10L2P2X5Y6Z7\n$#\n");
    assert!(output.contains("[G55:5.000,6.000,7.000]"));
}

#[test]
fn program_pause_resumes_on_cycle_start() {
    let (mut machine, handle) = Machine::with_loopback();
    handle.inject(b"G1X2F600\nM0\n");
    let resume = handle.clone();
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(100));
        resume.inject(b"~");
        resume.close();
    });
    machine.run();
    let output = handle.take_output();
    assert_eq!(output.matches("ok\r\n").count(), 2);
    assert_eq!(machine.state, MachineState::Idle);
    assert_eq!(machine.shared.position.snapshot(), [500, 0, 0]);
}

#[test]
fn zero_length_move_is_dropped_silently() {
    let (machine, output) = run_with_input(b"G0X0\n");
    assert!(output.contains("ok\r\n"));
    assert_eq!(machine.shared.position.snapshot(), [0, 0, 0]);
    assert!(machine.planner.is_empty());
}

#[test]
fn startup_line_runs_after_reset_boot() {
    // Store a startup line, then boot a machine over the same image.
    let (mut machine, handle) = Machine::with_loopback();
    handle.inject(b"$N0=G20\n");
    handle.close();
    machine.run();

    // Simulate the reboot: reuse the store in a fresh machine.
    let rt_flags = std::sync::Arc::new(carve_common::state::RtFlags::new());
    let (transport, handle2) =
        carve_core::serial::LoopbackTransport::pair(std::sync::Arc::clone(&rt_flags));
    let mut rebooted = Machine::new(machine.nvs, Box::new(transport), rt_flags);
    handle2.close();
    rebooted.run();
    let output = handle2.take_output();
    assert!(output.contains(">G20:ok\r\n"));
    assert_eq!(
        rebooted.gc.modal.units,
        carve_core::gcode::UnitsMode::Inches
    );
}

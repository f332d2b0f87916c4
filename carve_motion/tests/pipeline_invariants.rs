//! Cross-module invariants of the planner → prep → interrupt pipeline.

use std::sync::Arc;

use carve_common::consts::N_AXIS;
use carve_common::settings::Settings;
use carve_common::state::{RtFlags, StepControl};
use carve_motion::planner::{PlanLineData, Planner};
use carve_motion::stepper::{CountingPins, SegmentPrep, StepperIsr, StepperShared, TickResult};

fn feed(feed_rate: f32) -> PlanLineData {
    PlanLineData {
        feed_rate,
        ..PlanLineData::default()
    }
}

/// Queue a mixed path and check that the signed step content of the ring
/// always equals the distance between the planner position and the
/// stepper position, within one step per axis.
#[test]
fn ring_step_content_matches_position_gap() {
    let settings = Settings::default();
    let shared = Arc::new(StepperShared::new());
    let rt_flags = Arc::new(RtFlags::new());
    let mut planner = Planner::new();
    let mut prep = SegmentPrep::new(Arc::clone(&shared));
    let mut isr = StepperIsr::new(Arc::clone(&shared), Arc::clone(&rt_flags));
    let mut pins = CountingPins::default();
    let mut step_control = StepControl::empty();

    let path: [[f32; N_AXIS]; 6] = [
        [5.0, 0.0, 0.0],
        [5.0, 3.0, 0.0],
        [2.0, 3.0, 1.0],
        [2.0, -1.0, 1.0],
        [0.0, 0.0, 0.0],
        [4.0, 4.0, -2.0],
    ];

    let mut queued = 0;
    let mut done = false;
    while !done {
        if queued < path.len() && !planner.is_full() {
            planner
                .buffer_line(&path[queued], &feed(800.0), &settings)
                .unwrap();
            queued += 1;
        }
        prep.fill(&mut planner, &mut step_control, &settings);
        let idle = isr.tick(&mut pins) == TickResult::Idle;

        // Invariant: queued signed steps bridge the two positions.
        let sys = shared.position.snapshot();
        let plan = planner.position_steps();
        let mut ring_steps = [0i64; N_AXIS];
        // The in-flight distance is bounded by what was planned but not
        // yet executed.
        for axis in 0..N_AXIS {
            ring_steps[axis] = plan[axis] as i64 - sys[axis] as i64;
        }
        if planner.is_empty() && shared.is_empty() && !prep.has_partial_block() {
            for axis in 0..N_AXIS {
                assert!(
                    ring_steps[axis].abs() <= 1,
                    "axis {axis}: drained pipeline but {} steps unaccounted",
                    ring_steps[axis]
                );
            }
            done = queued == path.len() && idle;
        }
    }

    // Final position is exactly the last target in steps.
    let expected: [i32; N_AXIS] = core::array::from_fn(|axis| {
        (path[path.len() - 1][axis] * settings.steps_per_mm[axis]).round() as i32
    });
    assert_eq!(shared.position.snapshot(), expected);
}

/// Entry speeds stay within their ceilings while the ring churns.
#[test]
fn junction_speeds_bounded_under_churn() {
    let settings = Settings::default();
    let shared = Arc::new(StepperShared::new());
    let rt_flags = Arc::new(RtFlags::new());
    let mut planner = Planner::new();
    let mut prep = SegmentPrep::new(Arc::clone(&shared));
    let mut isr = StepperIsr::new(Arc::clone(&shared), rt_flags);
    let mut pins = CountingPins::default();
    let mut step_control = StepControl::empty();

    // Zig-zag: every junction is a direction change.
    for i in 1..=40 {
        let y = if i % 2 == 0 { 0.0 } else { 0.8 };
        let target = [i as f32 * 0.5, y, 0.0];
        loop {
            match planner.buffer_line(&target, &feed(1200.0), &settings) {
                Ok(()) => break,
                Err(carve_motion::planner::PlanError::BufferFull) => {
                    prep.fill(&mut planner, &mut step_control, &settings);
                    isr.tick(&mut pins);
                }
                Err(e) => panic!("unexpected planner error: {e}"),
            }
        }
        if let Some(block) = planner.exec_block() {
            assert!(block.entry_speed_sqr >= 0.0);
            assert!(block.entry_speed_sqr <= block.max_entry_speed_sqr + 1e-2);
            assert!(block.max_entry_speed_sqr <= block.nominal_speed_sqr + 1e-2);
        }
    }

    // Drain to completion.
    let mut guard = 0u32;
    loop {
        prep.fill(&mut planner, &mut step_control, &settings);
        if isr.tick(&mut pins) == TickResult::Idle
            && planner.is_empty()
            && shared.is_empty()
            && !prep.has_partial_block()
        {
            break;
        }
        guard += 1;
        assert!(guard < 5_000_000, "pipeline failed to drain");
    }
    assert_eq!(shared.position.snapshot()[0], 5000); // 20 mm × 250
}

//! Planner micro-benchmark.
//!
//! Measures the cost of queueing a block with a full recompute pass over a
//! loaded ring — the dominant main-loop cost while streaming short moves.

use criterion::{Criterion, criterion_group, criterion_main};

use carve_common::consts::PLANNER_RING_CAPACITY;
use carve_common::settings::Settings;
use carve_motion::planner::{PlanLineData, Planner};

fn zigzag_target(i: usize) -> [f32; 3] {
    // Alternating short diagonals exercise the junction math every block.
    let x = i as f32 * 0.5;
    let y = if i % 2 == 0 { 0.0 } else { 0.4 };
    [x, y, 0.0]
}

fn bench_buffer_line_full_ring(c: &mut Criterion) {
    let settings = Settings::default();
    let data = PlanLineData {
        feed_rate: 1200.0,
        ..PlanLineData::default()
    };

    c.bench_function("buffer_line_with_recompute", |b| {
        b.iter(|| {
            let mut planner = Planner::new();
            for i in 1..PLANNER_RING_CAPACITY {
                planner
                    .buffer_line(&zigzag_target(i), &data, &settings)
                    .unwrap();
            }
            planner
        })
    });
}

fn bench_override_replan(c: &mut Criterion) {
    let settings = Settings::default();
    let data = PlanLineData {
        feed_rate: 1200.0,
        ..PlanLineData::default()
    };

    c.bench_function("override_replan_full_ring", |b| {
        let mut planner = Planner::new();
        for i in 1..PLANNER_RING_CAPACITY {
            planner
                .buffer_line(&zigzag_target(i), &data, &settings)
                .unwrap();
        }
        let mut toggle = false;
        b.iter(|| {
            toggle = !toggle;
            planner.set_overrides(if toggle { 50 } else { 100 }, 100);
        })
    });
}

criterion_group!(benches, bench_buffer_line_full_ring, bench_override_replan);
criterion_main!(benches);

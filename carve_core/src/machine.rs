//! The owning machine value: every subsystem, one construction point.
//!
//! All process-wide state of the firmware lives here with a documented
//! init/reset/teardown contract. Interior mutability exists only at the
//! interrupt-crossing boundary: the realtime mailbox, the segment ring
//! indices, and the authoritative step position.

use std::sync::Arc;

use carve_common::consts::N_AXIS;
use carve_common::nvs::{self, MemoryStore, NonVolatileStore};
use carve_common::settings::Settings;
use carve_common::state::{MachineState, RtFlags, StepControl, Suspend};
use carve_motion::planner::Planner;
use carve_motion::position::steps_to_mm;
use carve_motion::stepper::{CountingPins, SegmentPrep, StepperIsr, StepperShared};
use tracing::info;

use crate::gcode::ParserState;
use crate::serial::{LoopbackHandle, LoopbackTransport, Transport};

// ─── Pin Contracts ──────────────────────────────────────────────────

/// Limit switch inputs, one bit per axis.
pub trait LimitPins: Send {
    /// Bitmask of axes whose limit switch is currently active.
    fn limit_state(&self) -> u8;
}

/// Probe input.
pub trait ProbePin: Send {
    fn is_triggered(&self) -> bool;
}

/// Simulated limit switches at the positive end of travel: an axis's
/// switch reads active once the machine position reaches the trip point.
pub struct SimLimits {
    shared: Arc<StepperShared>,
    trip_at_steps: [Option<i32>; N_AXIS],
}

impl SimLimits {
    pub fn new(shared: Arc<StepperShared>) -> Self {
        Self {
            shared,
            trip_at_steps: [None; N_AXIS],
        }
    }

    /// Place a switch at `steps` on `axis`.
    pub fn set_trip(&mut self, axis: usize, steps: i32) {
        self.trip_at_steps[axis] = Some(steps);
    }
}

impl LimitPins for SimLimits {
    fn limit_state(&self) -> u8 {
        let position = self.shared.position.snapshot();
        let mut mask = 0;
        for axis in 0..N_AXIS {
            if let Some(trip) = self.trip_at_steps[axis] {
                if position[axis] >= trip {
                    mask |= 1 << axis;
                }
            }
        }
        mask
    }
}

/// Simulated probe tripping at a position threshold on one axis.
pub struct SimProbe {
    shared: Arc<StepperShared>,
    trip: Option<(usize, i32)>,
}

impl SimProbe {
    pub fn new(shared: Arc<StepperShared>) -> Self {
        Self { shared, trip: None }
    }

    pub fn set_trip(&mut self, axis: usize, steps: i32) {
        self.trip = Some((axis, steps));
    }
}

impl ProbePin for SimProbe {
    fn is_triggered(&self) -> bool {
        match self.trip {
            Some((axis, steps)) => self.shared.position.get(axis) >= steps,
            None => false,
        }
    }
}

// ─── Step Driver ────────────────────────────────────────────────────

/// The interrupt core plus its pin block. Owned by the machine for
/// inline ticking, or taken by the dedicated tick thread.
pub struct StepDriver {
    pub isr: StepperIsr,
    pub pins: CountingPins,
}

// ─── Machine ────────────────────────────────────────────────────────

/// The whole firmware, as a value.
pub struct Machine {
    pub settings: Settings,
    pub nvs: Box<dyn NonVolatileStore>,
    pub transport: Box<dyn Transport>,
    pub rt_flags: Arc<RtFlags>,
    pub shared: Arc<StepperShared>,
    pub planner: Planner,
    pub prep: SegmentPrep,
    /// Present while the machine ticks the interrupt inline; `None` once
    /// a tick thread has taken it.
    pub driver: Option<StepDriver>,
    pub limits: Box<dyn LimitPins>,
    pub probe: Box<dyn ProbePin>,
    pub state: MachineState,
    pub suspend: Suspend,
    pub step_control: StepControl,
    /// Parser state (`gc_state`).
    pub gc: ParserState,
    /// Unwind-to-main flag set by soft reset.
    pub abort: bool,
    /// A homing cycle has completed since power-up.
    pub homed: bool,
    /// Last probe contact position [steps].
    pub probe_position: [i32; N_AXIS],
    /// The last probe cycle made contact.
    pub probe_succeeded: bool,
}

impl Machine {
    /// Build the machine: read the non-volatile image, restore settings,
    /// pre-allocate the motion pipeline.
    pub fn new(
        mut nvs: Box<dyn NonVolatileStore>,
        transport: Box<dyn Transport>,
        rt_flags: Arc<RtFlags>,
    ) -> Self {
        let wiped = nvs::init_store(nvs.as_mut()).unwrap_or(true);
        let (settings, restored) = Settings::load_or_default(nvs.as_mut());
        if wiped || restored {
            info!(wiped, restored, "settings restored to defaults");
            let _ = settings.save(nvs.as_mut());
        }

        let shared = Arc::new(StepperShared::new());
        let prep = SegmentPrep::new(Arc::clone(&shared));
        let isr = StepperIsr::new(Arc::clone(&shared), Arc::clone(&rt_flags));
        let limits = Box::new(SimLimits::new(Arc::clone(&shared)));
        let probe = Box::new(SimProbe::new(Arc::clone(&shared)));

        Self {
            settings,
            nvs,
            transport,
            rt_flags,
            shared,
            planner: Planner::new(),
            prep,
            driver: Some(StepDriver {
                isr,
                pins: CountingPins::default(),
            }),
            limits,
            probe,
            state: MachineState::Idle,
            suspend: Suspend::empty(),
            step_control: StepControl::empty(),
            gc: ParserState::default(),
            abort: false,
            homed: false,
            probe_position: [0; N_AXIS],
            probe_succeeded: false,
        }
    }

    /// In-memory machine with a loopback serial link, for tests.
    pub fn for_tests() -> Self {
        let rt_flags = Arc::new(RtFlags::new());
        let (transport, _handle) = LoopbackTransport::pair(Arc::clone(&rt_flags));
        Self::new(Box::new(MemoryStore::new()), Box::new(transport), rt_flags)
    }

    /// Test machine plus the host side of its serial link.
    pub fn with_loopback() -> (Self, LoopbackHandle) {
        let rt_flags = Arc::new(RtFlags::new());
        let (transport, handle) = LoopbackTransport::pair(Arc::clone(&rt_flags));
        let machine = Self::new(Box::new(MemoryStore::new()), Box::new(transport), rt_flags);
        (machine, handle)
    }

    /// Hand the interrupt core to a dedicated tick thread.
    pub fn take_driver(&mut self) -> Option<StepDriver> {
        self.driver.take()
    }

    /// True while `$C` check mode is active.
    #[inline]
    pub fn check_mode(&self) -> bool {
        self.state == MachineState::CheckMode
    }

    /// Machine position derived from the authoritative step count [mm].
    pub fn machine_position_mm(&self) -> [f32; N_AXIS] {
        steps_to_mm(&self.shared.position.snapshot(), &self.settings.steps_per_mm)
    }

    /// Total step pulses emitted per axis (inline driver only).
    pub fn steps_emitted(&self) -> [u32; N_AXIS] {
        self.driver
            .as_ref()
            .map(|d| d.pins.steps)
            .unwrap_or([0; N_AXIS])
    }

    /// Top up the segment ring and, when the driver is inline, execute
    /// one interrupt tick.
    pub fn pump_motion(&mut self) {
        if self.state.is_motion_state() {
            self.prep
                .fill(&mut self.planner, &mut self.step_control, &self.settings);
        }
        if let Some(driver) = &mut self.driver {
            driver.isr.tick(&mut driver.pins);
        }
    }

    /// Re-initialise everything volatile after a soft reset.
    ///
    /// Motion rings are flushed, the parser returns to power-up defaults,
    /// and the position shadows resync from the authoritative step count.
    pub fn reset_machine(&mut self) {
        // Reset with steps in flight loses position; a completed hold is
        // parked at zero speed and stays trustworthy.
        let had_motion = match self.state {
            MachineState::Cycle | MachineState::Homing | MachineState::Jog => true,
            MachineState::Hold => !self.suspend.contains(Suspend::HOLD_COMPLETE),
            _ => false,
        };
        self.mc_reset();
        self.rt_flags.clear_all();
        self.suspend = Suspend::empty();
        self.step_control = StepControl::empty();

        self.gc = ParserState::default();
        self.gc.position = self.machine_position_mm();
        self.gc.coord_system = nvs::load_coord_data(self.nvs.as_mut(), 0).unwrap_or_default();
        self.planner.sync_position(&self.shared.position.snapshot());

        if had_motion {
            // Steps were likely lost mid-motion: position is untrusted.
            self.state = MachineState::Alarm;
            self.rt_flags
                .set_alarm(carve_common::alarm::Alarm::AbortCycle);
        } else if self.state != MachineState::Alarm {
            self.state = MachineState::Idle;
        }
        self.abort = false;
        info!(state = ?self.state, "machine reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_restores_default_settings() {
        let machine = Machine::for_tests();
        assert_eq!(machine.settings, Settings::default());
        assert_eq!(machine.state, MachineState::Idle);
        assert!(machine.planner.is_empty());
    }

    #[test]
    fn settings_survive_in_store_across_machines() {
        let rt_flags = Arc::new(RtFlags::new());
        let (transport, _handle) = LoopbackTransport::pair(Arc::clone(&rt_flags));
        let mut nvs = Box::new(MemoryStore::new());
        nvs::init_store(nvs.as_mut()).unwrap();
        let mut settings = Settings::default();
        settings.set(11, 0.02).unwrap();
        settings.save(nvs.as_mut()).unwrap();

        let machine = Machine::new(nvs, Box::new(transport), rt_flags);
        assert_eq!(machine.settings.junction_deviation, 0.02);
    }

    #[test]
    fn sim_limits_trip_on_position() {
        let machine = Machine::for_tests();
        let mut limits = SimLimits::new(Arc::clone(&machine.shared));
        limits.set_trip(0, 100);
        assert_eq!(limits.limit_state(), 0);
        machine.shared.position.set_all(&[100, 0, 0]);
        assert_eq!(limits.limit_state(), 0b001);
    }
}

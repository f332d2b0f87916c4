//! Machine state, suspend/step-control bitsets, and the realtime mailbox.
//!
//! The mailbox crosses the interrupt boundary: receive-side code sets bits,
//! the protocol loop consumes them. All flag words are lock-free atomics
//! with bit-or set and fetch-and clear, so a set from the RX side can never
//! lose a concurrent set from the stepper side.

use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use crate::alarm::Alarm;

// ─── Machine State ──────────────────────────────────────────────────

/// Top-level machine state.
///
/// Exactly one state is active at any time. `Alarm` is sticky: the only
/// exits are `$X` unlock and reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MachineState {
    /// Ready, no motion queued or executing.
    Idle = 0,
    /// Locked out; only `$` commands accepted.
    Alarm = 1,
    /// `$C` dry-run: parse and validate without motion.
    CheckMode = 2,
    /// `$H` homing cycle in progress.
    Homing = 3,
    /// Executing queued motion.
    Cycle = 4,
    /// Feed hold: decelerating or parked mid-program.
    Hold = 5,
    /// One-shot jog motion in progress.
    Jog = 6,
    /// `$SLP` sleep; reset required to wake.
    Sleep = 7,
}

impl MachineState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Alarm),
            2 => Some(Self::CheckMode),
            3 => Some(Self::Homing),
            4 => Some(Self::Cycle),
            5 => Some(Self::Hold),
            6 => Some(Self::Jog),
            7 => Some(Self::Sleep),
            _ => None,
        }
    }

    /// Status-report label for this state.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Alarm => "Alarm",
            Self::CheckMode => "Check",
            Self::Homing => "Home",
            Self::Cycle => "Run",
            Self::Hold => "Hold",
            Self::Jog => "Jog",
            Self::Sleep => "Sleep",
        }
    }

    /// True while the stepper may be emitting pulses.
    #[inline]
    pub const fn is_motion_state(&self) -> bool {
        matches!(self, Self::Cycle | Self::Homing | Self::Jog | Self::Hold)
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::Idle
    }
}

// ─── Bitset Words ───────────────────────────────────────────────────

bitflags! {
    /// Why the main loop is parked in a suspend wait.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Suspend: u8 {
        /// Deceleration finished; machine parked at zero speed.
        const HOLD_COMPLETE = 0x01;
        /// Queued motion is being cancelled, not resumed.
        const MOTION_CANCEL = 0x02;
        /// Jog-specific cancel: flush rings, resync parser.
        const JOG_CANCEL    = 0x04;
    }
}

bitflags! {
    /// What the segment generator should do next.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StepControl: u8 {
        /// Halt cleanly at the end of the current segment.
        const END_MOTION         = 0x01;
        /// Override the profile with a deceleration to zero.
        const EXECUTE_HOLD       = 0x02;
        /// Executing a system motion (homing/parking), not queued g-code.
        const EXECUTE_SYS_MOTION = 0x04;
        /// Spindle PWM changed; restamp upcoming segments.
        const UPDATE_SPINDLE_PWM = 0x08;
    }
}

bitflags! {
    /// Realtime execution requests, set from the RX interrupt path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecState: u8 {
        const STATUS_REPORT = 0x01;
        const CYCLE_START   = 0x02;
        const CYCLE_STOP    = 0x04;
        const FEED_HOLD     = 0x08;
        const RESET         = 0x10;
        const MOTION_CANCEL = 0x20;
        const SLEEP         = 0x40;
    }
}

bitflags! {
    /// Override-change requests, set from the RX interrupt path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecOverride: u8 {
        const FEED_RESET        = 0x01;
        const FEED_COARSE_PLUS  = 0x02;
        const FEED_COARSE_MINUS = 0x04;
        const FEED_FINE_PLUS    = 0x08;
        const FEED_FINE_MINUS   = 0x10;
        const RAPID_RESET       = 0x20;
        const RAPID_MEDIUM      = 0x40;
        const RAPID_LOW         = 0x80;
    }
}

// ─── Realtime Mailbox ───────────────────────────────────────────────

/// Interrupt-to-mainline mailbox: three atomic flag words.
///
/// Setters may run on any thread (RX side, stepper thread); the protocol
/// loop is the only consumer. `take_*` swaps the word to zero so a set
/// racing the take lands in the next protocol pass instead of vanishing.
#[derive(Debug, Default)]
pub struct RtFlags {
    exec_state: AtomicU8,
    exec_alarm: AtomicU8,
    exec_override: AtomicU8,
}

impl RtFlags {
    pub const fn new() -> Self {
        Self {
            exec_state: AtomicU8::new(0),
            exec_alarm: AtomicU8::new(0),
            exec_override: AtomicU8::new(0),
        }
    }

    /// Set execution request bits (bit-or, interrupt-safe).
    #[inline]
    pub fn set_state(&self, flags: ExecState) {
        self.exec_state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear specific execution request bits.
    #[inline]
    pub fn clear_state(&self, flags: ExecState) {
        self.exec_state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Peek at pending execution requests without consuming them.
    #[inline]
    pub fn state(&self) -> ExecState {
        ExecState::from_bits_truncate(self.exec_state.load(Ordering::Acquire))
    }

    /// Consume all pending execution requests.
    #[inline]
    pub fn take_state(&self) -> ExecState {
        ExecState::from_bits_truncate(self.exec_state.swap(0, Ordering::AcqRel))
    }

    /// Raise an alarm. The first alarm wins until consumed.
    #[inline]
    pub fn set_alarm(&self, alarm: Alarm) {
        let _ = self.exec_alarm.compare_exchange(
            0,
            alarm.code(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Consume the pending alarm, if any.
    #[inline]
    pub fn take_alarm(&self) -> Option<Alarm> {
        Alarm::from_u8(self.exec_alarm.swap(0, Ordering::AcqRel))
    }

    /// True if an alarm is pending.
    #[inline]
    pub fn alarm_pending(&self) -> bool {
        self.exec_alarm.load(Ordering::Acquire) != 0
    }

    /// Set override-change request bits.
    #[inline]
    pub fn set_override(&self, flags: ExecOverride) {
        self.exec_override.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Consume all pending override-change requests.
    #[inline]
    pub fn take_override(&self) -> ExecOverride {
        ExecOverride::from_bits_truncate(self.exec_override.swap(0, Ordering::AcqRel))
    }

    /// Drop every pending request and alarm. Used on reset.
    pub fn clear_all(&self) {
        self.exec_state.store(0, Ordering::Release);
        self.exec_alarm.store(0, Ordering::Release);
        self.exec_override.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_state_roundtrip() {
        for v in 0..=7u8 {
            let state = MachineState::from_u8(v).unwrap();
            assert_eq!(state as u8, v);
        }
        assert!(MachineState::from_u8(8).is_none());
        assert!(MachineState::from_u8(255).is_none());
    }

    #[test]
    fn machine_state_motion_states() {
        assert!(MachineState::Cycle.is_motion_state());
        assert!(MachineState::Homing.is_motion_state());
        assert!(MachineState::Jog.is_motion_state());
        assert!(MachineState::Hold.is_motion_state());
        assert!(!MachineState::Idle.is_motion_state());
        assert!(!MachineState::Alarm.is_motion_state());
        assert!(!MachineState::Sleep.is_motion_state());
    }

    #[test]
    fn rt_flags_set_and_take() {
        let flags = RtFlags::new();
        flags.set_state(ExecState::FEED_HOLD);
        flags.set_state(ExecState::STATUS_REPORT);
        assert_eq!(
            flags.state(),
            ExecState::FEED_HOLD | ExecState::STATUS_REPORT
        );
        let taken = flags.take_state();
        assert_eq!(taken, ExecState::FEED_HOLD | ExecState::STATUS_REPORT);
        assert!(flags.state().is_empty());
    }

    #[test]
    fn rt_flags_first_alarm_wins() {
        let flags = RtFlags::new();
        flags.set_alarm(Alarm::HardLimit);
        flags.set_alarm(Alarm::SoftLimit);
        assert_eq!(flags.take_alarm(), Some(Alarm::HardLimit));
        assert_eq!(flags.take_alarm(), None);
    }

    #[test]
    fn rt_flags_clear_all() {
        let flags = RtFlags::new();
        flags.set_state(ExecState::RESET);
        flags.set_alarm(Alarm::AbortCycle);
        flags.set_override(ExecOverride::FEED_RESET);
        flags.clear_all();
        assert!(flags.state().is_empty());
        assert!(!flags.alarm_pending());
        assert!(flags.take_override().is_empty());
    }
}

//! The `$n` settings table.
//!
//! Settings are machine state, not boot configuration: they live in the
//! non-volatile image, are written one at a time via `$n=value`, and every
//! write is validated against per-setting bounds before it lands.
//!
//! Axis-indexed settings occupy decade blocks: `$100+axis` steps/mm,
//! `$110+axis` max rate, `$120+axis` acceleration, `$130+axis` max travel.

use crate::consts::{
    ALL_AXES_MASK, MAX_STEP_RATE_HZ, N_AXIS, SECONDS_PER_MINUTE,
};
use crate::nvs::{self, NonVolatileStore, NvsError, ADDR_GLOBAL_SETTINGS};
use crate::status::Status;

/// Every setting number, in `$$` dump order. Also the NVS field order.
pub const SETTING_NUMBERS: [u32; 22 + 4 * N_AXIS] = [
    0, 1, 2, 3, 4, 5, 6, 10, 11, 12, 13, 20, 21, 22, 23, 24, 25, 26, 27, 30, 31, 32, //
    100, 101, 102, 110, 111, 112, 120, 121, 122, 130, 131, 132,
];

/// The complete `$n` table.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// $0 — step pulse width [µs]. Minimum 3.
    pub pulse_microseconds: u8,
    /// $1 — delay before disabling steppers after motion [ms]; 255 keeps them enabled.
    pub step_idle_delay_ms: u8,
    /// $2 — step pin invert mask.
    pub step_invert_mask: u8,
    /// $3 — direction pin invert mask.
    pub dir_invert_mask: u8,
    /// $4 — invert the stepper-enable pin.
    pub step_enable_invert: bool,
    /// $5 — invert limit pin sense.
    pub limit_invert: bool,
    /// $6 — invert probe pin sense.
    pub probe_invert: bool,
    /// $10 — status report field mask (bit0 machine position, bit1 buffer state).
    pub status_report_mask: u8,
    /// $11 — junction deviation [mm].
    pub junction_deviation: f32,
    /// $12 — arc interpolation tolerance [mm].
    pub arc_tolerance: f32,
    /// $13 — report positions in inches.
    pub report_inches: bool,
    /// $20 — soft limits enabled (requires homing).
    pub soft_limits: bool,
    /// $21 — hard limits enabled.
    pub hard_limits: bool,
    /// $22 — homing cycle enabled.
    pub homing_enable: bool,
    /// $23 — homing direction invert mask.
    pub homing_dir_mask: u8,
    /// $24 — homing locate feed rate [mm/min].
    pub homing_feed_rate: f32,
    /// $25 — homing search seek rate [mm/min].
    pub homing_seek_rate: f32,
    /// $26 — homing switch debounce delay [ms].
    pub homing_debounce_ms: u16,
    /// $27 — homing pull-off distance [mm].
    pub homing_pulloff: f32,
    /// $30 — maximum spindle speed [RPM].
    pub rpm_max: f32,
    /// $31 — minimum spindle speed [RPM].
    pub rpm_min: f32,
    /// $32 — laser mode (no pause on spindle speed change).
    pub laser_mode: bool,
    /// $100+axis — steps per millimetre.
    pub steps_per_mm: [f32; N_AXIS],
    /// $110+axis — maximum rate [mm/min].
    pub max_rate: [f32; N_AXIS],
    /// $120+axis — acceleration [mm/s²].
    pub acceleration: [f32; N_AXIS],
    /// $130+axis — maximum travel from home [mm], stored positive.
    pub max_travel: [f32; N_AXIS],
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pulse_microseconds: 10,
            step_idle_delay_ms: 25,
            step_invert_mask: 0,
            dir_invert_mask: 0,
            step_enable_invert: false,
            limit_invert: false,
            probe_invert: false,
            status_report_mask: 1,
            junction_deviation: 0.010,
            arc_tolerance: 0.002,
            report_inches: false,
            soft_limits: false,
            hard_limits: false,
            homing_enable: false,
            homing_dir_mask: 0,
            homing_feed_rate: 25.0,
            homing_seek_rate: 500.0,
            homing_debounce_ms: 250,
            homing_pulloff: 1.0,
            rpm_max: 1000.0,
            rpm_min: 0.0,
            laser_mode: false,
            steps_per_mm: [250.0; N_AXIS],
            max_rate: [500.0; N_AXIS],
            acceleration: [10.0; N_AXIS],
            max_travel: [200.0; N_AXIS],
        }
    }
}

impl Settings {
    /// Acceleration for `axis` in planner units [mm/min²].
    #[inline]
    pub fn acceleration_mm_min2(&self, axis: usize) -> f32 {
        self.acceleration[axis] * SECONDS_PER_MINUTE * SECONDS_PER_MINUTE
    }

    /// Read setting `n`. `None` for unassigned numbers.
    pub fn get(&self, n: u32) -> Option<f32> {
        Some(match n {
            0 => self.pulse_microseconds as f32,
            1 => self.step_idle_delay_ms as f32,
            2 => self.step_invert_mask as f32,
            3 => self.dir_invert_mask as f32,
            4 => self.step_enable_invert as u8 as f32,
            5 => self.limit_invert as u8 as f32,
            6 => self.probe_invert as u8 as f32,
            10 => self.status_report_mask as f32,
            11 => self.junction_deviation,
            12 => self.arc_tolerance,
            13 => self.report_inches as u8 as f32,
            20 => self.soft_limits as u8 as f32,
            21 => self.hard_limits as u8 as f32,
            22 => self.homing_enable as u8 as f32,
            23 => self.homing_dir_mask as f32,
            24 => self.homing_feed_rate,
            25 => self.homing_seek_rate,
            26 => self.homing_debounce_ms as f32,
            27 => self.homing_pulloff,
            30 => self.rpm_max,
            31 => self.rpm_min,
            32 => self.laser_mode as u8 as f32,
            100..=102 => self.steps_per_mm[(n - 100) as usize],
            110..=112 => self.max_rate[(n - 110) as usize],
            120..=122 => self.acceleration[(n - 120) as usize],
            130..=132 => self.max_travel[(n - 130) as usize],
            _ => return None,
        })
    }

    /// Write setting `n`, enforcing per-setting bounds.
    pub fn set(&mut self, n: u32, value: f32) -> Result<(), Status> {
        if value < 0.0 {
            return Err(Status::NegativeValue);
        }
        match n {
            0 => {
                if value < 3.0 {
                    return Err(Status::SettingStepPulseMin);
                }
                self.pulse_microseconds = as_u8(value)?;
            }
            1 => self.step_idle_delay_ms = as_u8(value)?,
            2 => self.step_invert_mask = as_mask(value)?,
            3 => self.dir_invert_mask = as_mask(value)?,
            4 => self.step_enable_invert = value != 0.0,
            5 => self.limit_invert = value != 0.0,
            6 => self.probe_invert = value != 0.0,
            10 => self.status_report_mask = as_u8(value)?,
            11 => self.junction_deviation = value,
            12 => self.arc_tolerance = value,
            13 => self.report_inches = value != 0.0,
            20 => {
                // Soft limits cannot work on an unhomed machine.
                if value != 0.0 && !self.homing_enable {
                    return Err(Status::SoftLimitError);
                }
                self.soft_limits = value != 0.0;
            }
            21 => self.hard_limits = value != 0.0,
            22 => {
                self.homing_enable = value != 0.0;
                if !self.homing_enable {
                    self.soft_limits = false;
                }
            }
            23 => self.homing_dir_mask = as_mask(value)?,
            24 => self.homing_feed_rate = value,
            25 => self.homing_seek_rate = value,
            26 => self.homing_debounce_ms = as_u16(value)?,
            27 => self.homing_pulloff = value,
            30 => self.rpm_max = value,
            31 => self.rpm_min = value,
            32 => self.laser_mode = value != 0.0,
            100..=102 => {
                let axis = (n - 100) as usize;
                check_step_rate(value, self.max_rate[axis])?;
                self.steps_per_mm[axis] = value;
            }
            110..=112 => {
                let axis = (n - 110) as usize;
                check_step_rate(self.steps_per_mm[axis], value)?;
                self.max_rate[axis] = value;
            }
            120..=122 => self.acceleration[(n - 120) as usize] = value,
            130..=132 => self.max_travel[(n - 130) as usize] = value,
            _ => return Err(Status::InvalidStatement),
        }
        Ok(())
    }

    /// All `(number, value)` pairs in `$$` dump order.
    pub fn entries(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        SETTING_NUMBERS
            .iter()
            .map(|&n| (n, self.get(n).unwrap_or(0.0)))
    }

    // ── Persistence ──

    /// Serialized size of the settings record [bytes].
    const RECORD_SIZE: usize = SETTING_NUMBERS.len() * 4;

    /// Persist the table to the non-volatile image.
    pub fn save(&self, store: &mut dyn NonVolatileStore) -> Result<(), NvsError> {
        let mut payload = [0u8; Self::RECORD_SIZE];
        for (i, &n) in SETTING_NUMBERS.iter().enumerate() {
            let value = self.get(n).unwrap_or(0.0);
            payload[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        nvs::write_record(store, ADDR_GLOBAL_SETTINGS, &payload)
    }

    /// Load the table from the non-volatile image.
    ///
    /// Checksum mismatch propagates so the caller can restore defaults and
    /// report [`Status::SettingReadFail`].
    pub fn load(store: &dyn NonVolatileStore) -> Result<Self, NvsError> {
        let mut payload = [0u8; Self::RECORD_SIZE];
        nvs::read_record(store, ADDR_GLOBAL_SETTINGS, &mut payload)?;
        let mut settings = Self::default();
        // Two passes: interdependent settings ($20 needs $22) settle on the
        // second. A stale value a pass rejects falls back to its default.
        for _ in 0..2 {
            for (i, &n) in SETTING_NUMBERS.iter().enumerate() {
                let mut word = [0u8; 4];
                word.copy_from_slice(&payload[i * 4..i * 4 + 4]);
                let _ = settings.set(n, f32::from_le_bytes(word));
            }
        }
        Ok(settings)
    }

    /// Load, restoring and persisting defaults on a bad record.
    ///
    /// Returns the table and `true` when defaults were restored.
    pub fn load_or_default(store: &mut dyn NonVolatileStore) -> (Self, bool) {
        match Self::load(store) {
            Ok(settings) => (settings, false),
            Err(_) => {
                let settings = Self::default();
                let _ = settings.save(store);
                (settings, true)
            }
        }
    }
}

fn as_u8(value: f32) -> Result<u8, Status> {
    if value > u8::MAX as f32 {
        return Err(Status::MaxValueExceeded);
    }
    Ok(value as u8)
}

fn as_u16(value: f32) -> Result<u16, Status> {
    if value > u16::MAX as f32 {
        return Err(Status::MaxValueExceeded);
    }
    Ok(value as u16)
}

fn as_mask(value: f32) -> Result<u8, Status> {
    let mask = as_u8(value)?;
    if mask & !ALL_AXES_MASK != 0 {
        return Err(Status::MaxValueExceeded);
    }
    Ok(mask)
}

fn check_step_rate(steps_per_mm: f32, max_rate: f32) -> Result<(), Status> {
    if steps_per_mm * max_rate / SECONDS_PER_MINUTE > MAX_STEP_RATE_HZ {
        return Err(Status::MaxStepRateExceeded);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvs::MemoryStore;

    #[test]
    fn every_number_reads_and_writes() {
        let mut settings = Settings::default();
        for &n in SETTING_NUMBERS.iter() {
            let value = settings.get(n).unwrap();
            settings.set(n, value).unwrap();
            assert_eq!(settings.get(n).unwrap(), value, "setting {n}");
        }
    }

    #[test]
    fn unknown_setting_rejected() {
        let mut settings = Settings::default();
        assert_eq!(settings.set(7, 1.0), Err(Status::InvalidStatement));
        assert_eq!(settings.set(99, 1.0), Err(Status::InvalidStatement));
        assert!(settings.get(99).is_none());
    }

    #[test]
    fn negative_value_rejected() {
        let mut settings = Settings::default();
        assert_eq!(settings.set(11, -0.01), Err(Status::NegativeValue));
        assert_eq!(settings.set(100, -250.0), Err(Status::NegativeValue));
    }

    #[test]
    fn step_pulse_minimum_enforced() {
        let mut settings = Settings::default();
        assert_eq!(settings.set(0, 2.0), Err(Status::SettingStepPulseMin));
        settings.set(0, 3.0).unwrap();
        assert_eq!(settings.pulse_microseconds, 3);
    }

    #[test]
    fn soft_limits_require_homing() {
        let mut settings = Settings::default();
        assert_eq!(settings.set(20, 1.0), Err(Status::SoftLimitError));
        settings.set(22, 1.0).unwrap();
        settings.set(20, 1.0).unwrap();
        assert!(settings.soft_limits);
        // Disabling homing drags soft limits down with it.
        settings.set(22, 0.0).unwrap();
        assert!(!settings.soft_limits);
    }

    #[test]
    fn step_rate_ceiling_enforced() {
        let mut settings = Settings::default();
        // 250 steps/mm and this rate would exceed the timer ceiling.
        let too_fast = MAX_STEP_RATE_HZ * SECONDS_PER_MINUTE / 250.0 + 1.0;
        assert_eq!(settings.set(110, too_fast), Err(Status::MaxStepRateExceeded));
        // And the converse on steps/mm against the current rate.
        settings.set(100, 100.0).unwrap();
        settings.set(110, 12_000.0).unwrap();
        assert_eq!(settings.set(100, 200.0), Err(Status::MaxStepRateExceeded));
    }

    #[test]
    fn mask_settings_bounded_to_axes() {
        let mut settings = Settings::default();
        settings.set(2, 5.0).unwrap();
        assert_eq!(settings.step_invert_mask, 5);
        assert_eq!(settings.set(2, 8.0), Err(Status::MaxValueExceeded));
        assert_eq!(settings.set(3, 300.0), Err(Status::MaxValueExceeded));
    }

    #[test]
    fn write_read_roundtrip_through_store() {
        let mut store = MemoryStore::new();
        let mut settings = Settings::default();
        settings.set(11, 0.025).unwrap();
        settings.set(101, 320.0).unwrap();
        settings.set(22, 1.0).unwrap();
        settings.save(&mut store).unwrap();

        let loaded = Settings::load(&store).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn corrupt_record_restores_defaults() {
        let mut store = MemoryStore::new();
        let mut settings = Settings::default();
        settings.set(11, 0.05).unwrap();
        settings.save(&mut store).unwrap();
        // Corrupt one byte of the record.
        store.write_bytes(ADDR_GLOBAL_SETTINGS, &[0xFF]).unwrap();

        let (loaded, restored) = Settings::load_or_default(&mut store);
        assert!(restored);
        assert_eq!(loaded, Settings::default());
        // The defaults were re-persisted with a good checksum.
        let (again, restored_again) = Settings::load_or_default(&mut store);
        assert!(!restored_again);
        assert_eq!(again, Settings::default());
    }

    #[test]
    fn acceleration_unit_conversion() {
        let settings = Settings::default();
        assert_eq!(settings.acceleration_mm_min2(0), 10.0 * 3600.0);
    }
}

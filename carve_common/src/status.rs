//! Per-line status codes — the `error:<n>` namespace.
//!
//! Every parser and system operation returns `Result<_, Status>`; the first
//! non-OK status aborts the line and is reported verbatim over the serial
//! link. Wire numbers are stable.

use thiserror::Error;

/// Numeric status code reported as `error:<n>`.
///
/// Grouped per the error taxonomy: parse errors, semantic errors,
/// system errors. Alarm conditions live in [`crate::alarm::Alarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum Status {
    /// G-code word must start with a letter.
    #[error("expected command letter")]
    ExpectedCommandLetter = 1,
    /// Letter was not followed by a readable number.
    #[error("bad number format")]
    BadNumberFormat = 2,
    /// `$` system command not recognized or not valid now.
    #[error("invalid statement")]
    InvalidStatement = 3,
    /// Negative value for a word that requires a positive one.
    #[error("negative value")]
    NegativeValue = 4,
    /// Setting is compile- or config-disabled.
    #[error("setting disabled")]
    SettingDisabled = 5,
    /// Step pulse must be at least 3 microseconds.
    #[error("step pulse too short")]
    SettingStepPulseMin = 6,
    /// Non-volatile record failed its checksum and was restored to defaults.
    #[error("non-volatile read failed")]
    SettingReadFail = 7,
    /// Command requires the machine to be idle.
    #[error("not idle")]
    IdleError = 8,
    /// G-code lines are locked out in the current state (alarm or jog).
    #[error("g-code lock")]
    SystemGcLock = 9,
    /// Soft limits require homing to be enabled.
    #[error("homing not enabled")]
    SoftLimitError = 10,
    /// Line overflowed the assembler buffer.
    #[error("line overflow")]
    Overflow = 11,
    /// A setting combination exceeds the reachable step rate.
    #[error("max step rate exceeded")]
    MaxStepRateExceeded = 12,
    /// Safety door reported ajar (retained for wire compatibility).
    #[error("check door")]
    CheckDoor = 13,
    /// Build-info or startup line exceeds the storable length.
    #[error("line length exceeded")]
    LineLengthExceeded = 14,
    /// Jog target is outside machine travel.
    #[error("travel exceeded")]
    TravelExceeded = 15,
    /// Jog command syntax invalid (disallowed words for `$J=`).
    #[error("invalid jog command")]
    InvalidJogCommand = 16,
    /// Laser mode requires PWM-capable spindle output.
    #[error("setting disabled in laser mode")]
    SettingDisabledLaser = 17,

    /// Unsupported or invalid g-code command.
    #[error("unsupported command")]
    UnsupportedCommand = 20,
    /// More than one command from the same modal group in the block.
    #[error("modal group violation")]
    ModalGroupViolation = 21,
    /// Feed rate has not been set or is undefined.
    #[error("undefined feed rate")]
    UndefinedFeedRate = 22,
    /// Command value is not an integer where one is required.
    #[error("command value not integer")]
    CommandValueNotInteger = 23,
    /// Two commands in the block both require axis words.
    #[error("axis command conflict")]
    AxisCommandConflict = 24,
    /// A word was repeated within the block.
    #[error("word repeated")]
    WordRepeated = 25,
    /// Command requires axis words and none were given.
    #[error("no axis words")]
    NoAxisWords = 26,
    /// `N` line number outside 1..=MAX_LINE_NUMBER.
    #[error("invalid line number")]
    InvalidLineNumber = 27,
    /// Command requires a value word that is missing.
    #[error("value word missing")]
    ValueWordMissing = 28,
    /// Coordinate system select outside the supported G54-G59 range.
    #[error("unsupported coordinate system")]
    UnsupportedCoordSys = 29,
    /// G53 only valid with G0 or G1 motion mode.
    #[error("G53 invalid motion mode")]
    G53InvalidMotionMode = 30,
    /// Axis words found with a command that does not use them.
    #[error("axis words with no command")]
    AxisWordsNoCommand = 31,
    /// Arc motion requires in-plane axis words.
    #[error("no axis words in plane")]
    NoAxisWordsInPlane = 32,
    /// Motion target invalid (arc geometry disagreement, zero-length arc).
    #[error("invalid target")]
    InvalidTarget = 33,
    /// Radius-form arc geometry unsolvable.
    #[error("arc radius error")]
    ArcRadiusError = 34,
    /// Offset-form arc missing in-plane IJK offsets.
    #[error("no offsets in plane")]
    NoOffsetsInPlane = 35,
    /// Value words left over after the block consumed what it uses.
    #[error("unused words")]
    UnusedWords = 36,
    /// G43.1 dynamic tool length offset on an invalid axis.
    #[error("G43.1 dynamic axis error")]
    G43DynamicAxisError = 37,
    /// Value exceeds the maximum the setting or word supports.
    #[error("max value exceeded")]
    MaxValueExceeded = 38,
}

impl Status {
    /// Stable wire number for `error:<n>` reports.
    #[inline]
    pub const fn code(&self) -> u8 {
        *self as u8
    }

    /// Convert from a raw wire number. Returns `None` for unknown codes.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::ExpectedCommandLetter,
            2 => Self::BadNumberFormat,
            3 => Self::InvalidStatement,
            4 => Self::NegativeValue,
            5 => Self::SettingDisabled,
            6 => Self::SettingStepPulseMin,
            7 => Self::SettingReadFail,
            8 => Self::IdleError,
            9 => Self::SystemGcLock,
            10 => Self::SoftLimitError,
            11 => Self::Overflow,
            12 => Self::MaxStepRateExceeded,
            13 => Self::CheckDoor,
            14 => Self::LineLengthExceeded,
            15 => Self::TravelExceeded,
            16 => Self::InvalidJogCommand,
            17 => Self::SettingDisabledLaser,
            20 => Self::UnsupportedCommand,
            21 => Self::ModalGroupViolation,
            22 => Self::UndefinedFeedRate,
            23 => Self::CommandValueNotInteger,
            24 => Self::AxisCommandConflict,
            25 => Self::WordRepeated,
            26 => Self::NoAxisWords,
            27 => Self::InvalidLineNumber,
            28 => Self::ValueWordMissing,
            29 => Self::UnsupportedCoordSys,
            30 => Self::G53InvalidMotionMode,
            31 => Self::AxisWordsNoCommand,
            32 => Self::NoAxisWordsInPlane,
            33 => Self::InvalidTarget,
            34 => Self::ArcRadiusError,
            35 => Self::NoOffsetsInPlane,
            36 => Self::UnusedWords,
            37 => Self::G43DynamicAxisError,
            38 => Self::MaxValueExceeded,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_roundtrip() {
        for code in 1..=38u8 {
            // 18 and 19 are unassigned gaps in the wire numbering.
            if code == 18 || code == 19 {
                assert!(Status::from_code(code).is_none());
                continue;
            }
            let status = Status::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(Status::from_code(0).is_none());
        assert!(Status::from_code(39).is_none());
        assert!(Status::from_code(255).is_none());
    }

    #[test]
    fn status_messages_are_lowercase_short() {
        let msg = Status::ModalGroupViolation.to_string();
        assert_eq!(msg, "modal group violation");
    }
}
